//! Host model of the LDMA arbitration harness: a simulated controller the
//! firmware driver runs against unchanged, plus the scenario runner used by
//! the `ldma-arbitration` binary.

pub mod bus;
pub mod scenario;
mod simulated;

pub use simulated::{Grant, SimClock, SimulatedLdma};
