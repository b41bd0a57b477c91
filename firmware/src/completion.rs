//! Completion bookkeeping shared by polling, blocking, async and callback
//! consumers. Every way of learning that a channel finished goes through
//! the same [`ChannelEvent`]s.

use core::task::Waker;

use embassy_sync::waitqueue::WakerRegistration;
use heapless::Vec;
use ldma_core::{ChannelId, ChannelMask};

use crate::Error;

pub const MAX_HANDLERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelEvent {
    Completed(ChannelId),
    Failed(ChannelId),
    Stopped(ChannelId),
}

impl ChannelEvent {
    pub const fn channel(&self) -> ChannelId {
        match *self {
            ChannelEvent::Completed(channel)
            | ChannelEvent::Failed(channel)
            | ChannelEvent::Stopped(channel) => channel,
        }
    }
}

pub type Handler = fn(ChannelEvent);

pub struct Completion {
    done: ChannelMask,
    failed: ChannelMask,
    stopped: ChannelMask,
    interrupts: u32,
    handlers: Vec<Handler, MAX_HANDLERS>,
    waker: WakerRegistration,
}

impl Completion {
    pub const fn new() -> Self {
        Self {
            done: ChannelMask::EMPTY,
            failed: ChannelMask::EMPTY,
            stopped: ChannelMask::EMPTY,
            interrupts: 0,
            handlers: Vec::new(),
            waker: WakerRegistration::new(),
        }
    }

    /// Forgets the previous outcome of `channel` before it is started again.
    pub fn arm(&mut self, channel: ChannelId) {
        self.done.remove(channel);
        self.failed.remove(channel);
        self.stopped.remove(channel);
    }

    pub fn record(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Completed(channel) => self.done.insert(channel),
            ChannelEvent::Failed(channel) => self.failed.insert(channel),
            ChannelEvent::Stopped(channel) => self.stopped.insert(channel),
        }
        self.waker.wake();
    }

    /// `None` while any channel in `channels` is still running. Failures
    /// win over stops, stops over completion.
    pub fn outcome(&self, channels: ChannelMask) -> Option<Result<(), Error>> {
        if let Some(channel) = self.failed.intersection(channels).iter().next() {
            return Some(Err(Error::Transfer { channel }));
        }
        if let Some(channel) = self.stopped.intersection(channels).iter().next() {
            return Some(Err(Error::Stopped { channel }));
        }
        if self.done.intersection(channels) == channels {
            return Some(Ok(()));
        }
        None
    }

    pub fn is_done(&self, channel: ChannelId) -> bool {
        self.done.contains(channel)
    }

    pub fn failed(&self) -> ChannelMask {
        self.failed
    }

    pub fn count_interrupt(&mut self) {
        self.interrupts = self.interrupts.wrapping_add(1);
    }

    pub fn interrupts(&self) -> u32 {
        self.interrupts
    }

    pub fn register_handler(&mut self, handler: Handler) -> Result<(), Error> {
        self.handlers
            .push(handler)
            .map_err(|_| Error::HandlerSlotsFull)
    }

    pub fn handlers(&self) -> Vec<Handler, MAX_HANDLERS> {
        self.handlers.clone()
    }

    /// Only the most recently registered waker is kept.
    pub fn register_waker(&mut self, waker: &Waker) {
        self.waker.register(waker);
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}
