//! The seam between the transfer driver and whatever executes descriptors:
//! the memory-mapped LDMA on target, or a model of it on the host.

use ldma_core::{ArbSlots, ChannelId, ChannelMask, TriggerSource};

/// Per-channel registers written before a chain is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelSetup {
    pub trigger: TriggerSource,
    pub slots: ArbSlots,
    /// Initial LOOP counter value.
    pub loop_count: u8,
    /// Route the channel's done flag to the LDMA interrupt.
    pub interrupt: bool,
}

/// Interrupt flags collected (and cleared) in one read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Flags {
    pub done: ChannelMask,
    /// Channels halted because of a transfer error since the last read.
    pub errors: ChannelMask,
}

impl Flags {
    pub const fn is_empty(&self) -> bool {
        self.done.is_empty() && self.errors.is_empty()
    }
}

pub trait DmaController {
    /// Number of channels the controller implements.
    fn channel_count(&self) -> usize;

    /// Makes `words` words starting at `ptr` reachable for `channel` and
    /// returns the bus address they appear at.
    ///
    /// # Safety
    ///
    /// The memory must stay valid and must not be moved until
    /// [`DmaController::release`] is called for `channel`.
    unsafe fn map(&mut self, channel: ChannelId, ptr: *mut u32, words: usize) -> u32;

    /// Forgets every mapping made for `channel`.
    fn release(&mut self, channel: ChannelId);

    fn configure(&mut self, channel: ChannelId, setup: &ChannelSetup);

    /// Loads the descriptor at bus address `descriptor` and enables the channel.
    fn start(&mut self, channel: ChannelId, descriptor: u32);

    fn disable(&mut self, channels: ChannelMask);

    /// The CHEN register: channels that still have work left.
    fn enabled(&self) -> ChannelMask;

    fn take_flags(&mut self) -> Flags;

    fn interrupt_pending(&self) -> bool;

    /// Called while busy-waiting on the controller.
    fn relax(&mut self) {
        core::hint::spin_loop();
    }
}
