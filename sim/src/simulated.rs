use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use ldma_core::{
    board::{HFPERCLK_HZ, WTIMER0_CNT},
    config::SimulationConfig,
    descriptor::{AddrMode, ElementSize, RawDescriptor, ReqMode},
    ArbSlots, ChannelId, ChannelMask, TriggerSource, MAX_CHANNELS,
};
use ldma_firmware::{
    controller::{ChannelSetup, DmaController, Flags},
    timer::{Clock, Instant, TICK_HZ},
};

use crate::bus::{Bus, BusFault};

const IF_ERROR: u32 = 1 << 31;
const CHANNEL_BITS: u32 = (1 << MAX_CHANNELS) - 1;

/// One turn a channel got from the arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub channel: ChannelId,
    /// Cycle the first element of the grant was read at.
    pub cycle: u64,
    pub elements: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Bus(BusFault),
    /// A descriptor field the model does not implement.
    Descriptor { address: u32 },
}

impl From<BusFault> for Fault {
    fn from(value: BusFault) -> Self {
        Fault::Bus(value)
    }
}

/// The descriptor a channel is working through.
#[derive(Debug, Clone, Copy)]
struct Pass {
    address: u32,
    raw: RawDescriptor,
    remaining: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Channel {
    trigger: TriggerSource,
    slots: ArbSlots,
    loop_count: u8,
    src: u32,
    dst: u32,
    pass: Option<Pass>,
}

/// A cycle-counting model of the LDMA, TIMER0 and WTIMER0.
///
/// Nothing happens on its own: every [`DmaController::relax`] call makes
/// one arbitration decision and runs the granted blocks, or, with no
/// request pending, skips ahead to the next TIMER0 overflow.
pub struct SimulatedLdma {
    config: SimulationConfig,
    fixed_channels: u8,
    bus: Bus,
    cycles: Arc<AtomicU64>,
    next_overflow: u64,
    channels: [Channel; MAX_CHANNELS],
    enabled: ChannelMask,
    requests: ChannelMask,
    flags: u32,
    interrupt_enable: u32,
    /// Channels halted by a fault since the flags were last taken.
    errors: ChannelMask,
    round_robin: usize,
    grants: Vec<Grant>,
}

impl SimulatedLdma {
    pub fn new(fixed_channels: u8, config: SimulationConfig) -> Self {
        assert!(config.trigger_period > 0, "trigger_period must be nonzero");

        Self {
            config,
            fixed_channels,
            bus: Bus::new(),
            cycles: Arc::new(AtomicU64::new(0)),
            next_overflow: config.trigger_period as u64,
            channels: [Channel::default(); MAX_CHANNELS],
            enabled: ChannelMask::EMPTY,
            requests: ChannelMask::EMPTY,
            flags: 0,
            interrupt_enable: IF_ERROR,
            errors: ChannelMask::EMPTY,
            round_robin: 0,
            grants: Vec::new(),
        }
    }

    /// A clock that follows this model's cycle count.
    pub fn clock(&self) -> SimClock {
        SimClock {
            cycles: self.cycles.clone(),
        }
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Current WTIMER0 count.
    pub fn counter(&self) -> u32 {
        self.config
            .counter_start
            .wrapping_add(self.cycles() as u32)
    }

    pub fn grants(&self) -> &[Grant] {
        &self.grants
    }

    pub fn take_grants(&mut self) -> Vec<Grant> {
        core::mem::take(&mut self.grants)
    }

    pub fn is_mapped(&self, channel: ChannelId) -> bool {
        self.bus.is_mapped(channel)
    }

    /// Makes one arbitration decision. Returns `false` once no channel is
    /// enabled.
    pub fn step(&mut self) -> bool {
        let ready = self.enabled.intersection(self.requests);

        match self.pick(ready) {
            Some(channel) => self.grant(channel),
            None => {
                let idle = self.next_overflow.saturating_sub(self.cycles()).max(1);
                self.advance(idle);
            }
        }

        !self.enabled.is_empty()
    }

    fn advance(&mut self, cycles: u64) {
        let now = self.cycles.fetch_add(cycles, Ordering::Relaxed) + cycles;

        while self.next_overflow <= now {
            self.next_overflow += self.config.trigger_period as u64;

            let triggered: ChannelMask = self
                .enabled
                .iter()
                .filter(|channel| {
                    self.channels[channel.index()].trigger == TriggerSource::Timer0Overflow
                })
                .collect();
            self.requests = self.requests.union(triggered);
        }
    }

    /// Fixed-priority channels first, lowest index winning. Otherwise the
    /// first requesting channel at or after the round-robin pointer, which
    /// then moves past it.
    fn pick(&mut self, ready: ChannelMask) -> Option<ChannelId> {
        if let Some(channel) = ready
            .iter()
            .find(|channel| channel.index() < self.fixed_channels as usize)
        {
            return Some(channel);
        }

        let channel = (0..MAX_CHANNELS)
            .map(|offset| (self.round_robin + offset) % MAX_CHANNELS)
            .filter_map(|index| ChannelId::new(index as u8))
            .find(|&channel| ready.contains(channel))?;

        self.round_robin = (channel.index() + 1) % MAX_CHANNELS;
        Some(channel)
    }

    fn grant(&mut self, channel: ChannelId) {
        self.advance(self.config.arbitration_cycles as u64);

        let cycle = self.cycles();
        let mut elements = 0;

        for _ in 0..self.channels[channel.index()].slots.slots() {
            match self.transfer_block(channel) {
                Ok(moved) => elements += moved,
                Err(fault) => {
                    self.fault(channel, fault);
                    break;
                }
            }

            if self.config.clear_request_on_transfer
                && self.channels[channel.index()].trigger == TriggerSource::Timer0Overflow
            {
                self.requests.remove(channel);
            }
            if !self.enabled.intersection(self.requests).contains(channel) {
                break;
            }
        }

        if elements > 0 {
            log::trace!("channel {channel}: {elements} elements at cycle {cycle}");
            self.grants.push(Grant {
                channel,
                cycle,
                elements,
            });
        }
    }

    /// Moves one block, or the rest of the pass if that is shorter.
    fn transfer_block(&mut self, channel: ChannelId) -> Result<u32, Fault> {
        let index = channel.index();
        let Some(pass) = self.channels[index].pass else {
            return Ok(0);
        };
        let raw = pass.raw;

        // Only word transfers are modelled.
        let size = raw
            .size()
            .filter(|&size| size == ElementSize::Word)
            .ok_or(Fault::Descriptor {
                address: pass.address,
            })?;
        let units = raw
            .block_size()
            .ok_or(Fault::Descriptor {
                address: pass.address,
            })?
            .units();

        let block = match (raw.req_mode(), units) {
            (ReqMode::Block, Some(units)) => units.min(pass.remaining),
            _ => pass.remaining,
        };

        let src_step = raw.src_inc().elements() * size.bytes();
        let dst_step = raw.dst_inc().elements() * size.bytes();
        let (mut src, mut dst) = (self.channels[index].src, self.channels[index].dst);

        for _ in 0..block {
            let value = self.read(src)?;
            self.bus.write(dst, value)?;
            src = src.wrapping_add(src_step);
            dst = dst.wrapping_add(dst_step);
            self.advance(self.config.cycles_per_element as u64);
        }

        let state = &mut self.channels[index];
        state.src = src;
        state.dst = dst;
        state.pass = Some(Pass {
            remaining: pass.remaining - block,
            ..pass
        });

        if pass.remaining == block {
            self.end_pass(channel, pass)?;
        }

        Ok(block)
    }

    fn end_pass(&mut self, channel: ChannelId, pass: Pass) -> Result<(), Fault> {
        let raw = pass.raw;
        let state = &mut self.channels[channel.index()];

        if raw.done_ifs() {
            self.flags |= channel.mask().bits();
        }

        if raw.dec_loop_count() && state.loop_count > 0 {
            state.loop_count -= 1;
            self.load(channel, pass.address)
        } else if raw.link_enabled() {
            let next = match raw.link_mode() {
                AddrMode::Absolute => raw.link_address(),
                AddrMode::Relative => pass.address.wrapping_add(raw.link_address()),
            };
            self.load(channel, next)
        } else {
            log::trace!("channel {channel}: done at cycle {}", self.cycles());
            self.halt(channel);
            Ok(())
        }
    }

    fn load(&mut self, channel: ChannelId, address: u32) -> Result<(), Fault> {
        let raw = self.bus.read_descriptor(address)?;
        let state = &mut self.channels[channel.index()];

        state.src = match raw.src_mode() {
            AddrMode::Absolute => raw.src(),
            AddrMode::Relative => state.src.wrapping_add(raw.src()),
        };
        state.dst = match raw.dst_mode() {
            AddrMode::Absolute => raw.dst(),
            AddrMode::Relative => state.dst.wrapping_add(raw.dst()),
        };
        state.pass = Some(Pass {
            address,
            raw,
            remaining: raw.xfer_count(),
        });

        // A software request stays pending until the channel is done.
        if raw.struct_req() {
            self.requests.insert(channel);
        }
        Ok(())
    }

    fn read(&self, address: u32) -> Result<u32, BusFault> {
        if address == WTIMER0_CNT {
            Ok(self.counter())
        } else {
            self.bus.read(address)
        }
    }

    fn halt(&mut self, channel: ChannelId) {
        self.enabled.remove(channel);
        self.requests.remove(channel);
        self.channels[channel.index()].pass = None;
    }

    fn fault(&mut self, channel: ChannelId, fault: Fault) {
        log::debug!("channel {channel}: {fault:?}");
        self.flags |= IF_ERROR;
        self.errors.insert(channel);
        self.halt(channel);
    }
}

impl DmaController for SimulatedLdma {
    fn channel_count(&self) -> usize {
        MAX_CHANNELS
    }

    unsafe fn map(&mut self, channel: ChannelId, ptr: *mut u32, words: usize) -> u32 {
        self.bus.map(channel, ptr, words)
    }

    fn release(&mut self, channel: ChannelId) {
        self.bus.release(channel);
    }

    fn configure(&mut self, channel: ChannelId, setup: &ChannelSetup) {
        let state = &mut self.channels[channel.index()];
        state.trigger = setup.trigger;
        state.slots = setup.slots;
        state.loop_count = setup.loop_count;

        if setup.interrupt {
            self.interrupt_enable |= channel.mask().bits();
        } else {
            self.interrupt_enable &= !channel.mask().bits();
        }
    }

    fn start(&mut self, channel: ChannelId, descriptor: u32) {
        self.enabled.insert(channel);
        if let Err(fault) = self.load(channel, descriptor) {
            self.fault(channel, fault);
        }
    }

    fn disable(&mut self, channels: ChannelMask) {
        for channel in channels.iter() {
            self.halt(channel);
        }
    }

    fn enabled(&self) -> ChannelMask {
        self.enabled
    }

    fn take_flags(&mut self) -> Flags {
        let flags = core::mem::take(&mut self.flags);

        Flags {
            done: ChannelMask(flags & CHANNEL_BITS),
            errors: core::mem::take(&mut self.errors),
        }
    }

    fn interrupt_pending(&self) -> bool {
        self.flags & self.interrupt_enable != 0
    }

    fn relax(&mut self) {
        self.step();
    }
}

/// [`Clock`] driven by the simulated cycle count at the HFPER clock rate.
#[derive(Debug, Clone)]
pub struct SimClock {
    cycles: Arc<AtomicU64>,
}

impl Clock for SimClock {
    fn now(&mut self) -> Instant {
        let cycles = self.cycles.load(Ordering::Relaxed);
        Instant::from_ticks(cycles * TICK_HZ as u64 / HFPERCLK_HZ as u64)
    }
}
