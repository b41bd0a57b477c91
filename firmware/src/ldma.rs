//! [`DmaController`] for the EFM32GG11 LDMA peripheral.

use ldma_core::{
    board::{CMU_BASE, CMU_HFBUSCLKEN0, CMU_HFBUSCLKEN0_LDMA},
    ChannelId, ChannelMask, MAX_CHANNELS,
};

use crate::{
    controller::{ChannelSetup, DmaController, Flags},
    mmio,
};

const CTRL: u32 = 0x000;
const STATUS: u32 = 0x004;
const CHEN: u32 = 0x020;
const CHDONE: u32 = 0x028;
const REQCLEAR: u32 = 0x040;
const LINKLOAD: u32 = 0x03C;
const IF: u32 = 0x060;
const IFC: u32 = 0x068;
const IEN: u32 = 0x06C;

const CH_BASE: u32 = 0x080;
const CH_STRIDE: u32 = 0x030;
const CH_REQSEL: u32 = 0x000;
const CH_CFG: u32 = 0x004;
const CH_LOOP: u32 = 0x008;
const CH_LINK: u32 = 0x018;

const CTRL_NUMFIXED_SHIFT: u32 = 24;
const CTRL_NUMFIXED_MASK: u32 = 0x1F << CTRL_NUMFIXED_SHIFT;
const STATUS_CHERROR_SHIFT: u32 = 8;
const STATUS_CHERROR_MASK: u32 = 0x1F;
const CFG_ARBSLOTS_SHIFT: u32 = 16;
const IF_ERROR: u32 = 1 << 31;
const CHANNEL_BITS: u32 = (1 << MAX_CHANNELS) - 1;
const LINK_ADDR_MASK: u32 = !0b11;

pub struct Ldma {
    base: u32,
    /// Channels loaded through [`DmaController::start`] that have not been
    /// seen leaving CHEN yet.
    started: ChannelMask,
}

impl Ldma {
    /// # Safety
    ///
    /// `base` must be the LDMA register block and there must be only one
    /// `Ldma` for it.
    pub const unsafe fn new(base: u32) -> Self {
        Self {
            base,
            started: ChannelMask::EMPTY,
        }
    }

    /// Clocks the peripheral, selects how many channels get fixed priority
    /// and enables the error interrupt. All channels are stopped.
    pub fn init(&mut self, fixed_channels: u8) {
        // SAFETY: we own the register block
        unsafe {
            mmio::modify(CMU_BASE + CMU_HFBUSCLKEN0, |v| v | CMU_HFBUSCLKEN0_LDMA);

            self.write(CHEN, 0);
            self.write(REQCLEAR, CHANNEL_BITS);
            self.write(IFC, u32::MAX);
            self.modify(CTRL, |v| {
                (v & !CTRL_NUMFIXED_MASK)
                    | (((fixed_channels as u32) << CTRL_NUMFIXED_SHIFT) & CTRL_NUMFIXED_MASK)
            });
            self.write(IEN, IF_ERROR);
        }
        log::debug!("LDMA ready, {fixed_channels} fixed priority channels");
    }

    fn channel_register(channel: ChannelId, offset: u32) -> u32 {
        CH_BASE + channel.index() as u32 * CH_STRIDE + offset
    }

    unsafe fn read(&self, offset: u32) -> u32 {
        mmio::read(self.base + offset)
    }

    unsafe fn write(&mut self, offset: u32, value: u32) {
        mmio::write(self.base + offset, value)
    }

    unsafe fn modify(&mut self, offset: u32, f: impl FnOnce(u32) -> u32) {
        mmio::modify(self.base + offset, f)
    }
}

impl DmaController for Ldma {
    fn channel_count(&self) -> usize {
        MAX_CHANNELS
    }

    unsafe fn map(&mut self, _channel: ChannelId, ptr: *mut u32, _words: usize) -> u32 {
        // The LDMA sees SRAM at its CPU address.
        ptr as usize as u32
    }

    fn release(&mut self, _channel: ChannelId) {}

    fn configure(&mut self, channel: ChannelId, setup: &ChannelSetup) {
        let mask = channel.mask().bits();
        // SAFETY: we own the register block
        unsafe {
            self.write(Self::channel_register(channel, CH_REQSEL), setup.trigger.reqsel());
            self.write(
                Self::channel_register(channel, CH_CFG),
                (setup.slots.bits() as u32) << CFG_ARBSLOTS_SHIFT,
            );
            self.write(Self::channel_register(channel, CH_LOOP), setup.loop_count as u32);
            self.modify(IEN, |v| if setup.interrupt { v | mask } else { v & !mask });
        }
    }

    fn start(&mut self, channel: ChannelId, descriptor: u32) {
        let mask = channel.mask().bits();
        // SAFETY: we own the register block
        unsafe {
            self.write(
                Self::channel_register(channel, CH_LINK),
                descriptor & LINK_ADDR_MASK,
            );
            self.modify(CHDONE, |v| v & !mask);
            // LINKLOAD fetches the descriptor and sets the CHEN bit.
            self.write(LINKLOAD, mask);
        }
        self.started.insert(channel);
    }

    fn disable(&mut self, channels: ChannelMask) {
        // SAFETY: we own the register block
        unsafe {
            self.modify(CHEN, |v| v & !channels.bits());
            self.write(REQCLEAR, channels.bits());
        }
        self.started = self.started.difference(channels);
    }

    fn enabled(&self) -> ChannelMask {
        // SAFETY: reading CHEN has no side effects
        ChannelMask(unsafe { self.read(CHEN) } & CHANNEL_BITS)
    }

    fn take_flags(&mut self) -> Flags {
        // SAFETY: we own the register block
        let (flags, status, enabled, done) = unsafe {
            let flags = self.read(IF);
            self.write(IFC, flags);
            // CHEN before CHDONE, so a chain ending in between reads as done.
            let enabled = self.read(CHEN);
            (flags, self.read(STATUS), enabled, self.read(CHDONE))
        };

        let stopped = self.started.difference(ChannelMask(enabled & CHANNEL_BITS));
        self.started = self.started.difference(stopped);

        Flags {
            done: ChannelMask(flags & CHANNEL_BITS),
            errors: failed_channels(flags, status, stopped, ChannelMask(done & CHANNEL_BITS)),
        }
    }

    fn interrupt_pending(&self) -> bool {
        // SAFETY: reading IF and IEN has no side effects
        unsafe { self.read(IF) & self.read(IEN) != 0 }
    }
}

/// STATUS.CHERROR only names the most recent failure. Any other channel
/// that left CHEN without its CHDONE bit was halted by an error as well.
fn failed_channels(flags: u32, status: u32, stopped: ChannelMask, done: ChannelMask) -> ChannelMask {
    let mut errors = stopped.difference(done);
    if flags & IF_ERROR != 0 {
        if let Some(channel) =
            ChannelId::new(((status >> STATUS_CHERROR_SHIFT) & STATUS_CHERROR_MASK) as u8)
        {
            errors.insert(channel);
        }
    }
    errors
}
