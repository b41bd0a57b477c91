#![cfg_attr(not(test), no_std)]

pub mod completion;
pub mod controller;
mod error;
pub mod ldma;
mod mmio;
pub mod timer;
pub mod transfer;

pub use completion::ChannelEvent;
pub use controller::DmaController;
pub use error::Error;
pub use transfer::{ChannelHandle, Dma, TransferRequest, UNWRITTEN};
