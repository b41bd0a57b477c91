use core::{cell::RefCell, future::poll_fn, marker::PhantomData, ptr::NonNull, slice, task::Poll};

use critical_section::Mutex;
use heapless::Vec;
use ldma_core::{
    descriptor::{ChainParams, ChainSlot, DescriptorChain},
    ArbSlots, ChannelId, ChannelMask, TriggerSource, MAX_CHANNELS,
};

use crate::{
    completion::{ChannelEvent, Completion, Handler, MAX_HANDLERS},
    controller::{ChannelSetup, DmaController},
    timer::{Clock, Duration},
    Error,
};

/// One "copy a register into a buffer, block by block" job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferRequest {
    pub channel: ChannelId,
    pub slots: ArbSlots,
    pub trigger: TriggerSource,
    /// Bus address of the register every element is read from.
    pub source: u32,
    /// Number of blocks.
    pub count: u32,
    /// Words per block.
    pub block_len: u32,
    pub interrupt_on_done: bool,
}

impl TransferRequest {
    pub const fn new(channel: ChannelId, source: u32, count: u32, block_len: u32) -> Self {
        Self {
            channel,
            slots: ArbSlots::One,
            trigger: TriggerSource::Timer0Overflow,
            source,
            count,
            block_len,
            interrupt_on_done: false,
        }
    }

    pub const fn slots(mut self, slots: ArbSlots) -> Self {
        self.slots = slots;
        self
    }

    pub const fn trigger(mut self, trigger: TriggerSource) -> Self {
        self.trigger = trigger;
        self
    }

    pub const fn interrupt_on_done(mut self, enable: bool) -> Self {
        self.interrupt_on_done = enable;
        self
    }

    pub const fn total_elements(&self) -> usize {
        (self.count * self.block_len) as usize
    }
}

/// Fill value for capture buffers, so words the LDMA never wrote stand out
/// from counter values.
pub const UNWRITTEN: u32 = u32::MAX;

type Events = Vec<ChannelEvent, MAX_CHANNELS>;
type Handlers = Vec<Handler, MAX_HANDLERS>;

struct State<C> {
    controller: C,
    /// Channels started through this driver that have not finished yet.
    active: ChannelMask,
    /// Channels with a live [`ChannelHandle`], finished or not.
    claimed: ChannelMask,
    completion: Completion,
}

/// A channel leaves `active` when its event is pushed, so there is never
/// more than one event per channel.
fn push_event(events: &mut Events, event: ChannelEvent) {
    events
        .push(event)
        .ok()
        .expect("more events than channels");
}

impl<C: DmaController> State<C> {
    /// Turns controller flags and cleared CHEN bits into events.
    fn collect_events(&mut self) -> Events {
        let mut events = Events::new();

        // CHEN before the flags: a channel that faults after this read is
        // still enabled here, and its error is in the flags read next.
        let enabled = self.controller.enabled();
        let flags = self.controller.take_flags();

        if !flags.errors.is_empty() {
            log::warn!("transfer error on channels {:#x}, halting", flags.errors.bits());
            self.controller.disable(flags.errors);
        }
        for channel in flags.errors.intersection(self.active).iter() {
            self.active.remove(channel);
            push_event(&mut events, ChannelEvent::Failed(channel));
        }

        let finished = self.active.difference(enabled);
        for channel in finished.iter() {
            log::debug!("channel {channel}: chain complete");
            self.active.remove(channel);
            push_event(&mut events, ChannelEvent::Completed(channel));
        }

        for event in &events {
            self.completion.record(*event);
        }
        events
    }
}

/// Driver for one LDMA instance. Every access to the controller and to the
/// completion state happens inside a critical section, so a `Dma` can be
/// shared between thread mode and the interrupt handler.
pub struct Dma<C> {
    state: Mutex<RefCell<State<C>>>,
}

impl<C: DmaController> Dma<C> {
    pub const fn new(controller: C) -> Self {
        Self {
            state: Mutex::new(RefCell::new(State {
                controller,
                active: ChannelMask::EMPTY,
                claimed: ChannelMask::EMPTY,
                completion: Completion::new(),
            })),
        }
    }

    pub fn access<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        self.with_state(|state| f(&mut state.controller))
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State<C>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.state.borrow_ref_mut(cs)))
    }

    /// Builds the descriptor chain for `request` in `slot`, programs the
    /// channel and starts it. The channel then waits for its trigger.
    ///
    /// `slot` and `buffer` stay borrowed by the returned handle until the
    /// chain has been stopped and its memory released.
    ///
    /// # Panics
    ///
    /// If the channel does not exist on the controller, another handle for
    /// it is still alive, `buffer` is too small, or `count`/`block_len` are
    /// outside `1..256`.
    pub fn begin_transfer<'a>(
        &'a self,
        request: TransferRequest,
        slot: &'a mut ChainSlot,
        buffer: &'a mut [u32],
    ) -> Result<ChannelHandle<'a, C>, Error> {
        let channel = request.channel;
        let len = request.total_elements();
        assert!(
            buffer.len() >= len,
            "buffer holds {} words, the transfer needs {len}",
            buffer.len()
        );

        // The controller writes through these pointers while the channel
        // runs, so neither reference is used again.
        let slot = NonNull::from(slot);
        let buffer = NonNull::from(buffer).cast::<u32>();

        self.with_state(|state| {
            assert!(
                channel.index() < state.controller.channel_count(),
                "channel {channel} does not exist on this controller"
            );
            assert!(
                !state.claimed.contains(channel),
                "channel {channel} is already claimed by a handle"
            );

            // SAFETY: the handle owns `buffer` and `slot` for `'a` and
            // releases the mappings before that ends.
            let destination = unsafe { state.controller.map(channel, buffer.as_ptr(), len) };

            let mut params =
                ChainParams::new(request.source, destination, request.count, request.block_len);
            params.software_request = request.trigger == TriggerSource::Software;
            params.done_interrupt = request.interrupt_on_done;

            let chain = DescriptorChain::build(params);
            if let Err(e) = chain.validate() {
                state.controller.release(channel);
                return Err(Error::from(e));
            }

            // SAFETY: see above
            let base = unsafe {
                state
                    .controller
                    .map(channel, slot.as_ptr().cast(), ChainSlot::WORDS)
            };
            let mut encoded = ChainSlot::new();
            let head = chain.encode_into(&mut encoded, base);
            // SAFETY: the slot is ours and the channel is not running yet
            unsafe { slot.as_ptr().write(encoded) };

            state.completion.arm(channel);
            state.active.insert(channel);
            state.claimed.insert(channel);
            state.controller.configure(
                channel,
                &ChannelSetup {
                    trigger: request.trigger,
                    slots: request.slots,
                    loop_count: chain.loop_count(),
                    interrupt: request.interrupt_on_done,
                },
            );
            state.controller.start(channel, head);

            Ok(())
        })?;

        log::debug!(
            "channel {channel}: started {} x {} words, {} arbitration slots",
            request.count,
            request.block_len,
            request.slots.slots()
        );

        Ok(ChannelHandle {
            dma: self,
            channel,
            slot,
            buffer,
            len,
            released: false,
            _memory: PhantomData,
        })
    }

    /// Collects finished and failed channels, records them and runs the
    /// registered handlers. Returns the channels that finished in this call.
    pub fn service(&self) -> ChannelMask {
        let (events, handlers) = self.with_state(|state| {
            let events = state.collect_events();
            (events, state.completion.handlers())
        });
        dispatch(&events, &handlers)
    }

    /// Body of the LDMA interrupt vector.
    pub fn on_interrupt(&self) -> ChannelMask {
        self.with_state(|state| state.completion.count_interrupt());
        self.service()
    }

    /// Services the controller, taking the interrupt path if its interrupt
    /// line is asserted. Used by the waiting loops, which run with the LDMA
    /// vector masked.
    pub fn poll(&self) -> ChannelMask {
        if self.access(|controller| controller.interrupt_pending()) {
            self.on_interrupt()
        } else {
            self.service()
        }
    }

    /// Busy-waits until every channel in `channels` has completed, one of
    /// them failed or was stopped, or `timeout` has passed.
    pub fn wait(
        &self,
        channels: ChannelMask,
        clock: &mut impl Clock,
        timeout: Duration,
    ) -> Result<(), Error> {
        let deadline = clock.now() + timeout;

        loop {
            self.poll();

            if let Some(result) = self.with_state(|state| state.completion.outcome(channels)) {
                return result;
            }

            if clock.now() >= deadline {
                let pending = self.with_state(|state| state.active.intersection(channels));
                log::warn!("timed out, channels {:#x} still running", pending.bits());
                return Err(Error::Timeout { pending });
            }

            self.access(|controller| controller.relax());
        }
    }

    /// Resolves once every channel in `channels` has completed, or one of
    /// them failed or was stopped. Relies on someone else calling
    /// [`Dma::on_interrupt`], [`Dma::poll`] or [`Dma::service`].
    pub async fn wait_async(&self, channels: ChannelMask) -> Result<(), Error> {
        poll_fn(|cx| {
            self.with_state(|state| match state.completion.outcome(channels) {
                Some(result) => Poll::Ready(result),
                None => {
                    state.completion.register_waker(cx.waker());
                    Poll::Pending
                }
            })
        })
        .await
    }

    pub fn register_handler(&self, handler: Handler) -> Result<(), Error> {
        self.with_state(|state| state.completion.register_handler(handler))
    }

    pub fn interrupt_count(&self) -> u32 {
        self.with_state(|state| state.completion.interrupts())
    }

    pub fn active(&self) -> ChannelMask {
        self.with_state(|state| state.active)
    }

    pub fn failed(&self) -> ChannelMask {
        self.with_state(|state| state.completion.failed())
    }

    fn is_done(&self, channel: ChannelId) -> bool {
        self.with_state(|state| state.completion.is_done(channel))
    }

    /// Disables `channel` and drops its memory mappings. A channel that was
    /// still running is reported as stopped.
    fn halt(&self, channel: ChannelId) {
        let (events, handlers) = self.with_state(|state| {
            let mut events = state.collect_events();

            state.controller.disable(channel.mask());
            state.controller.release(channel);
            state.claimed.remove(channel);

            if state.active.contains(channel) {
                log::debug!("channel {channel}: stopped");
                state.active.remove(channel);
                let event = ChannelEvent::Stopped(channel);
                state.completion.record(event);
                push_event(&mut events, event);
            }

            (events, state.completion.handlers())
        });
        dispatch(&events, &handlers);
    }
}

fn dispatch(events: &[ChannelEvent], handlers: &Handlers) -> ChannelMask {
    let mut channels = ChannelMask::EMPTY;
    for event in events {
        channels.insert(event.channel());
        for handler in handlers {
            handler(*event);
        }
    }
    channels
}

/// A running (or finished) channel together with the memory it writes.
/// Dropping the handle stops the channel.
///
/// The chain slot and buffer are held as pointers: the controller writes
/// them behind the compiler's back, so a slice is only formed once the
/// channel can no longer touch the memory.
pub struct ChannelHandle<'a, C: DmaController> {
    dma: &'a Dma<C>,
    channel: ChannelId,
    slot: NonNull<ChainSlot>,
    buffer: NonNull<u32>,
    len: usize,
    released: bool,
    _memory: PhantomData<(&'a mut ChainSlot, &'a mut [u32])>,
}

impl<'a, C: DmaController> ChannelHandle<'a, C> {
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn is_active(&self) -> bool {
        self.dma.service();
        self.dma.active().contains(self.channel)
    }

    pub fn wait(&self, clock: &mut impl Clock, timeout: Duration) -> Result<(), Error> {
        self.dma.wait(self.channel.mask(), clock, timeout)
    }

    pub async fn wait_async(&self) -> Result<(), Error> {
        self.dma.wait_async(self.channel.mask()).await
    }

    /// The captured words, once the whole chain has completed.
    pub fn samples(&self) -> Option<&[u32]> {
        self.dma.service();
        self.dma.is_done(self.channel).then(|| {
            // SAFETY: the chain has completed, so the controller no longer
            // writes the buffer, and the channel cannot be restarted while
            // this handle exists.
            unsafe { slice::from_raw_parts(self.buffer.as_ptr(), self.len) }
        })
    }

    pub fn stop(mut self) {
        self.release();
    }

    /// Stops the channel if it is still running and hands back the part of
    /// the buffer the transfer covers.
    pub fn into_buffer(mut self) -> &'a mut [u32] {
        self.release();
        // SAFETY: the channel is disabled and unmapped, the buffer is
        // borrowed for `'a` and this handle is consumed.
        unsafe { slice::from_raw_parts_mut(self.buffer.as_ptr(), self.len) }
    }

    fn release(&mut self) {
        if !self.released {
            self.dma.halt(self.channel);
            // SAFETY: the slot is no longer mapped
            unsafe { self.slot.as_ptr().write(ChainSlot::new()) };
            self.released = true;
        }
    }
}

impl<C: DmaController> Drop for ChannelHandle<'_, C> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use core::pin::pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::{executor::block_on, poll};
    use ldma_core::descriptor::RawDescriptor;

    use super::*;
    use crate::{controller::Flags, timer::Instant};

    const SOURCE: u32 = ldma_core::board::WTIMER0_CNT;

    fn ch(i: u8) -> ChannelId {
        ChannelId::new(i).unwrap()
    }

    struct Region {
        channel: ChannelId,
        address: u32,
        ptr: *mut u32,
        words: usize,
    }

    /// Records what the driver programs and finishes channels on command.
    #[derive(Default)]
    struct FakeController {
        next_address: u32,
        regions: std::vec::Vec<Region>,
        setups: [Option<ChannelSetup>; MAX_CHANNELS],
        loaded: [Option<RawDescriptor>; MAX_CHANNELS],
        enabled: ChannelMask,
        interrupts: ChannelMask,
        flags: Flags,
        finish_on_relax: ChannelMask,
        relaxed: usize,
    }

    impl FakeController {
        fn region(&self, address: u32) -> &Region {
            self.regions
                .iter()
                .find(|r| r.address == address)
                .expect("address was not mapped")
        }

        /// Fills the channel's destination with 0, 1, 2, ... and ends the chain.
        fn finish(&mut self, channel: ChannelId) {
            let head = self.loaded[channel.index()].expect("channel was not started");
            let region = self.region(head.dst());
            for i in 0..region.words {
                unsafe { region.ptr.add(i).write(i as u32) };
            }

            self.enabled.remove(channel);
            if self.interrupts.contains(channel) {
                self.flags.done.insert(channel);
            }
        }

        fn fail(&mut self, channel: ChannelId) {
            self.enabled.remove(channel);
            self.flags.errors.insert(channel);
        }

        fn mapped(&self, channel: ChannelId) -> usize {
            self.regions.iter().filter(|r| r.channel == channel).count()
        }
    }

    impl DmaController for FakeController {
        fn channel_count(&self) -> usize {
            8
        }

        unsafe fn map(&mut self, channel: ChannelId, ptr: *mut u32, words: usize) -> u32 {
            let address = 0x2000_0000 + self.next_address;
            self.next_address += (words as u32 * 4 + 15) & !15;
            self.regions.push(Region {
                channel,
                address,
                ptr,
                words,
            });
            address
        }

        fn release(&mut self, channel: ChannelId) {
            self.regions.retain(|r| r.channel != channel);
        }

        fn configure(&mut self, channel: ChannelId, setup: &ChannelSetup) {
            self.setups[channel.index()] = Some(*setup);
            if setup.interrupt {
                self.interrupts.insert(channel);
            } else {
                self.interrupts.remove(channel);
            }
        }

        fn start(&mut self, channel: ChannelId, descriptor: u32) {
            let region = self.region(descriptor);
            let words = core::array::from_fn(|i| unsafe { region.ptr.add(i).read() });
            self.loaded[channel.index()] = Some(RawDescriptor(words));
            self.enabled.insert(channel);
        }

        fn disable(&mut self, channels: ChannelMask) {
            self.enabled = self.enabled.difference(channels);
        }

        fn enabled(&self) -> ChannelMask {
            self.enabled
        }

        fn take_flags(&mut self) -> Flags {
            core::mem::take(&mut self.flags)
        }

        fn interrupt_pending(&self) -> bool {
            !self.flags.done.intersection(self.interrupts).is_empty()
                || !self.flags.errors.is_empty()
        }

        fn relax(&mut self) {
            self.relaxed += 1;
            for channel in self.finish_on_relax.iter() {
                if self.enabled.contains(channel) {
                    self.finish(channel);
                }
            }
        }
    }

    /// Advances a millisecond per reading.
    struct StepClock(u64);

    impl Clock for StepClock {
        fn now(&mut self) -> Instant {
            self.0 += 1_000;
            Instant::from_ticks(self.0)
        }
    }

    #[test]
    fn programs_channel_and_chain() {
        let dma = Dma::new(FakeController::default());
        let mut slot = ChainSlot::new();
        let mut buffer = [0u32; 256];

        let request = TransferRequest::new(ch(3), SOURCE, 4, 64).slots(ArbSlots::Four);
        let handle = dma.begin_transfer(request, &mut slot, &mut buffer).unwrap();
        assert_eq!(handle.channel(), ch(3));
        assert!(handle.is_active());

        dma.access(|fake| {
            let setup = fake.setups[3].unwrap();
            assert_eq!(setup.loop_count, 2);
            assert_eq!(setup.slots, ArbSlots::Four);
            assert_eq!(setup.trigger, TriggerSource::Timer0Overflow);
            assert!(!setup.interrupt);

            // The buffer was mapped first, the descriptors second.
            let head = fake.loaded[3].unwrap();
            assert_eq!(head.dst(), 0x2000_0000);
            assert_eq!(head.src(), SOURCE);
            assert_eq!(head.xfer_count(), 64);
            assert!(head.link_enabled());
            assert_eq!(head.link_address(), 0x2000_0400 + RawDescriptor::BYTES);
            assert_eq!(fake.mapped(ch(3)), 2);
        });
    }

    #[test]
    fn software_trigger_requests_the_head() {
        let dma = Dma::new(FakeController::default());
        let mut slot = ChainSlot::new();
        let mut buffer = [0u32; 8];

        let request = TransferRequest::new(ch(0), SOURCE, 1, 8).trigger(TriggerSource::Software);
        let _handle = dma.begin_transfer(request, &mut slot, &mut buffer).unwrap();

        dma.access(|fake| {
            let head = fake.loaded[0].unwrap();
            assert!(head.struct_req());
            assert!(!head.link_enabled());
            assert_eq!(fake.setups[0].unwrap().loop_count, 0);
        });
    }

    #[test]
    fn samples_after_completion() {
        let dma = Dma::new(FakeController::default());
        let mut slot = ChainSlot::new();
        let mut buffer = [u32::MAX; 40];

        let request = TransferRequest::new(ch(2), SOURCE, 2, 16);
        let handle = dma.begin_transfer(request, &mut slot, &mut buffer).unwrap();
        assert_eq!(handle.samples(), None);

        dma.access(|fake| fake.finish(ch(2)));
        assert!(!handle.is_active());

        let samples = handle.samples().unwrap();
        assert_eq!(samples.len(), 32);
        assert_eq!(samples[31], 31);

        let buffer = handle.into_buffer();
        assert_eq!(buffer.len(), 32);
        assert_eq!(dma.access(|fake| fake.mapped(ch(2))), 0);
    }

    #[test]
    fn wait_returns_when_all_channels_finish() {
        let dma = Dma::new(FakeController::default());
        let (mut slot_a, mut slot_b) = (ChainSlot::new(), ChainSlot::new());
        let (mut a, mut b) = ([0u32; 16], [0u32; 16]);

        let first = dma
            .begin_transfer(TransferRequest::new(ch(4), SOURCE, 2, 8), &mut slot_a, &mut a)
            .unwrap();
        let second = dma
            .begin_transfer(TransferRequest::new(ch(5), SOURCE, 2, 8), &mut slot_b, &mut b)
            .unwrap();

        let both = ch(4).mask().union(ch(5).mask());
        dma.access(|fake| fake.finish_on_relax = both);

        let mut clock = StepClock(0);
        assert_eq!(dma.wait(both, &mut clock, Duration::millis(50)), Ok(()));
        assert!(first.samples().is_some());
        assert!(second.samples().is_some());
        assert!(dma.active().is_empty());
    }

    #[test]
    fn wait_times_out() {
        let dma = Dma::new(FakeController::default());
        let mut slot = ChainSlot::new();
        let mut buffer = [0u32; 4];

        let handle = dma
            .begin_transfer(TransferRequest::new(ch(1), SOURCE, 1, 4), &mut slot, &mut buffer)
            .unwrap();

        let mut clock = StepClock(0);
        assert_eq!(
            handle.wait(&mut clock, Duration::millis(10)),
            Err(Error::Timeout { pending: ch(1).mask() })
        );
        assert!(dma.access(|fake| fake.relaxed) > 0);
        assert!(handle.is_active());
    }

    #[test]
    fn transfer_error_fails_the_channel() {
        let dma = Dma::new(FakeController::default());
        let mut slot = ChainSlot::new();
        let mut buffer = [0u32; 4];

        let handle = dma
            .begin_transfer(TransferRequest::new(ch(6), SOURCE, 1, 4), &mut slot, &mut buffer)
            .unwrap();
        dma.access(|fake| fake.fail(ch(6)));

        let mut clock = StepClock(0);
        assert_eq!(
            handle.wait(&mut clock, Duration::millis(10)),
            Err(Error::Transfer { channel: ch(6) })
        );
        assert_eq!(handle.samples(), None);
        assert_eq!(dma.failed(), ch(6).mask());
        assert!(dma.active().is_empty());
    }

    #[test]
    fn every_fault_before_a_service_is_reported() {
        let dma = Dma::new(FakeController::default());
        let mut slots = [ChainSlot::new(), ChainSlot::new(), ChainSlot::new()];
        let mut buffers = [[u32::MAX; 8]; 3];
        let [slot_a, slot_b, slot_c] = &mut slots;
        let [a, b, c] = &mut buffers;

        let first = dma
            .begin_transfer(TransferRequest::new(ch(2), SOURCE, 1, 8), slot_a, a)
            .unwrap();
        let second = dma
            .begin_transfer(TransferRequest::new(ch(3), SOURCE, 1, 8), slot_b, b)
            .unwrap();
        let healthy = dma
            .begin_transfer(TransferRequest::new(ch(4), SOURCE, 1, 8), slot_c, c)
            .unwrap();

        dma.access(|fake| {
            fake.fail(ch(2));
            fake.fail(ch(3));
            fake.finish(ch(4));
        });
        assert_eq!(
            dma.service(),
            [ch(2), ch(3), ch(4)].into_iter().collect::<ChannelMask>()
        );
        assert_eq!(dma.failed(), ch(2).mask().union(ch(3).mask()));

        let mut clock = StepClock(0);
        assert_eq!(
            first.wait(&mut clock, Duration::millis(10)),
            Err(Error::Transfer { channel: ch(2) })
        );
        assert_eq!(
            second.wait(&mut clock, Duration::millis(10)),
            Err(Error::Transfer { channel: ch(3) })
        );
        assert_eq!(first.samples(), None);
        assert_eq!(second.samples(), None);
        assert_eq!(healthy.samples().map(|s| s[7]), Some(7));
        assert!(dma.access(|fake| fake.enabled.is_empty()));
    }

    #[test]
    fn one_service_reports_every_channel() {
        let dma = Dma::new(FakeController::default());
        let mut slots: [ChainSlot; 8] = core::array::from_fn(|_| ChainSlot::new());
        let mut buffers = [[0u32; 4]; 8];

        let handles: std::vec::Vec<_> = slots
            .iter_mut()
            .zip(&mut buffers)
            .enumerate()
            .map(|(i, (slot, buffer))| {
                dma.begin_transfer(TransferRequest::new(ch(i as u8), SOURCE, 1, 4), slot, buffer)
                    .unwrap()
            })
            .collect();

        dma.access(|fake| (0..8).for_each(|i| fake.finish(ch(i))));
        assert_eq!(dma.service(), ChannelMask(0xFF));
        assert!(handles.iter().all(|handle| handle.samples().is_some()));
    }

    #[test]
    #[should_panic(expected = "already claimed")]
    fn finished_channel_stays_claimed_until_dropped() {
        let dma = Dma::new(FakeController::default());
        let (mut slot_a, mut slot_b) = (ChainSlot::new(), ChainSlot::new());
        let (mut a, mut b) = ([0u32; 4], [0u32; 4]);

        let first = dma
            .begin_transfer(TransferRequest::new(ch(1), SOURCE, 1, 4), &mut slot_a, &mut a)
            .unwrap();
        dma.access(|fake| fake.finish(ch(1)));
        assert!(first.samples().is_some());

        let _second = dma.begin_transfer(TransferRequest::new(ch(1), SOURCE, 1, 4), &mut slot_b, &mut b);
    }

    #[test]
    fn stop_and_drop_release_the_channel() {
        let dma = Dma::new(FakeController::default());
        let mut slot = ChainSlot::new();
        let mut buffer = [0u32; 64];

        let handle = dma
            .begin_transfer(TransferRequest::new(ch(2), SOURCE, 4, 16), &mut slot, &mut buffer)
            .unwrap();
        handle.stop();

        assert!(dma.active().is_empty());
        assert_eq!(
            block_on(dma.wait_async(ch(2).mask())),
            Err(Error::Stopped { channel: ch(2) })
        );
        dma.access(|fake| {
            assert!(fake.enabled.is_empty());
            assert_eq!(fake.mapped(ch(2)), 0);
        });
        assert_eq!(slot.descriptors()[0], RawDescriptor::default());

        {
            let _dropped = dma
                .begin_transfer(TransferRequest::new(ch(2), SOURCE, 4, 16), &mut slot, &mut buffer)
                .unwrap();
            assert_eq!(dma.active(), ch(2).mask());
        }
        assert!(dma.active().is_empty());
        assert!(dma.access(|fake| fake.enabled.is_empty()));
    }

    #[test]
    fn restart_after_completion() {
        let dma = Dma::new(FakeController::default());
        let mut slot = ChainSlot::new();
        let mut buffer = [0u32; 8];

        for _ in 0..3 {
            let handle = dma
                .begin_transfer(TransferRequest::new(ch(7), SOURCE, 2, 4), &mut slot, &mut buffer)
                .unwrap();
            dma.access(|fake| fake.finish(ch(7)));
            assert_eq!(handle.samples().map(<[u32]>::len), Some(8));
        }
    }

    #[test]
    #[should_panic(expected = "already claimed")]
    fn channel_must_be_idle() {
        let dma = Dma::new(FakeController::default());
        let (mut slot_a, mut slot_b) = (ChainSlot::new(), ChainSlot::new());
        let (mut a, mut b) = ([0u32; 4], [0u32; 4]);

        let _first = dma
            .begin_transfer(TransferRequest::new(ch(1), SOURCE, 1, 4), &mut slot_a, &mut a)
            .unwrap();
        let _second = dma.begin_transfer(TransferRequest::new(ch(1), SOURCE, 1, 4), &mut slot_b, &mut b);
    }

    #[test]
    #[should_panic(expected = "does not exist")]
    fn channel_must_exist() {
        let dma = Dma::new(FakeController::default());
        let mut slot = ChainSlot::new();
        let mut buffer = [0u32; 4];
        let _ = dma.begin_transfer(TransferRequest::new(ch(8), SOURCE, 1, 4), &mut slot, &mut buffer);
    }

    #[test]
    #[should_panic(expected = "buffer holds")]
    fn buffer_must_fit() {
        let dma = Dma::new(FakeController::default());
        let mut slot = ChainSlot::new();
        let mut buffer = [0u32; 4];
        let _ = dma.begin_transfer(TransferRequest::new(ch(0), SOURCE, 2, 4), &mut slot, &mut buffer);
    }

    #[test]
    fn interrupts_and_handlers() {
        static COMPLETED: AtomicUsize = AtomicUsize::new(0);
        static STOPPED: AtomicUsize = AtomicUsize::new(0);

        fn count(event: ChannelEvent) {
            match event {
                ChannelEvent::Completed(_) => COMPLETED.fetch_add(1, Ordering::SeqCst),
                ChannelEvent::Stopped(_) => STOPPED.fetch_add(1, Ordering::SeqCst),
                ChannelEvent::Failed(_) => 0,
            };
        }

        let dma = Dma::new(FakeController::default());
        dma.register_handler(count).unwrap();

        let (mut slot_a, mut slot_b) = (ChainSlot::new(), ChainSlot::new());
        let (mut a, mut b) = ([0u32; 4], [0u32; 4]);

        let request = TransferRequest::new(ch(3), SOURCE, 1, 4).interrupt_on_done(true);
        let with_irq = dma.begin_transfer(request, &mut slot_a, &mut a).unwrap();
        let quiet = dma
            .begin_transfer(TransferRequest::new(ch(4), SOURCE, 1, 4), &mut slot_b, &mut b)
            .unwrap();

        dma.access(|fake| {
            assert!(fake.loaded[3].unwrap().done_ifs());
            assert!(!fake.loaded[4].unwrap().done_ifs());
            fake.finish(ch(3));
        });

        let mut clock = StepClock(0);
        with_irq.wait(&mut clock, Duration::millis(10)).unwrap();
        assert_eq!(dma.interrupt_count(), 1);
        assert_eq!(COMPLETED.load(Ordering::SeqCst), 1);

        quiet.stop();
        assert_eq!(STOPPED.load(Ordering::SeqCst), 1);
        assert_eq!(dma.interrupt_count(), 1);
    }

    #[test]
    fn async_wait() {
        let dma = Dma::new(FakeController::default());
        let mut slot = ChainSlot::new();
        let mut buffer = [0u32; 16];

        let handle = dma
            .begin_transfer(TransferRequest::new(ch(5), SOURCE, 2, 8), &mut slot, &mut buffer)
            .unwrap();

        block_on(async {
            let mut wait = pin!(handle.wait_async());
            assert!(poll!(wait.as_mut()).is_pending());

            dma.access(|fake| fake.finish(ch(5)));
            assert_eq!(dma.on_interrupt(), ch(5).mask());

            assert_eq!(wait.await, Ok(()));
        });
        assert_eq!(handle.samples().map(|s| s[15]), Some(15));
    }
}
