#![no_main]
#![no_std]

use core::fmt::{self, Write};

use cortex_m_rt::entry;
use defmt::unwrap;
use defmt_rtt as _;
use panic_probe as _;
use static_cell::StaticCell;

use ldma_core::{board, descriptor::ChainSlot, ArbSlots, ChannelId, ChannelMask};
use ldma_firmware::{
    ldma::Ldma,
    timer::{self, Duration, WideTimerClock},
    ChannelEvent, Dma, TransferRequest, UNWRITTEN,
};
use trace_observer::{
    report::{write_report, ReportOptions},
    Lane, TraceObserver, DEFAULT_ROW_LEN,
};

const CHANNELS: usize = 4;
const FIRST_CHANNEL: u8 = 2;
const FIXED_CHANNELS: u8 = 0;
const COUNT: u32 = 4;
const BLOCK_LEN: u32 = 64;
const SAMPLES: usize = (COUNT * BLOCK_LEN) as usize;
const TIMEOUT: Duration = Duration::millis(5_000);

defmt::timestamp!("{=u32}", {
    // SAFETY: reading the counter has no side effects
    unsafe { core::ptr::read_volatile(board::WTIMER0_CNT as usize as *const u32) }
});

// SAFETY: this is the only handle to the LDMA registers
static DMA: Dma<Ldma> = Dma::new(unsafe { Ldma::new(board::LDMA_BASE) });

static BUFFERS: StaticCell<[[u32; SAMPLES]; CHANNELS]> = StaticCell::new();
static SLOTS: StaticCell<[ChainSlot; CHANNELS]> = StaticCell::new();

fn log_event(event: ChannelEvent) {
    defmt::debug!("{}", event);
}

#[entry]
fn main() -> ! {
    log_to_defmt::setup();
    defmt::println!("LDMA arbitration harness");

    let buffers = BUFFERS.init([[UNWRITTEN; SAMPLES]; CHANNELS]);
    let slots = SLOTS.init(core::array::from_fn(|_| ChainSlot::new()));

    // SAFETY: nothing else uses TIMER0 or WTIMER0
    unsafe {
        timer::start_sample_counter();
        timer::start_trigger_timer(u16::MAX);
    }
    // SAFETY: the counter was started above
    let mut clock = unsafe { WideTimerClock::new() };

    DMA.access(|ldma| ldma.init(FIXED_CHANNELS));
    unwrap!(DMA.register_handler(log_event));

    let mut handles = heapless::Vec::<_, CHANNELS>::new();
    let mut running = ChannelMask::EMPTY;

    for (i, (slot, buffer)) in slots.iter_mut().zip(buffers.iter_mut()).enumerate() {
        let channel = unwrap!(ChannelId::new(FIRST_CHANNEL + i as u8));
        let request = TransferRequest::new(channel, board::WTIMER0_CNT, COUNT, BLOCK_LEN)
            .slots(unwrap!(ArbSlots::from_bits(i as u8)))
            .interrupt_on_done(true);

        let handle = unwrap!(DMA.begin_transfer(request, slot, buffer));
        running.insert(channel);
        if handles.push(handle).is_err() {
            defmt::panic!("more channels than handle slots");
        }
    }

    if let Err(e) = DMA.wait(running, &mut clock, TIMEOUT) {
        defmt::error!("{}", e);
    }

    let observer = TraceObserver::new(handles.iter().filter_map(|handle| {
        Some(Lane {
            channel: handle.channel(),
            samples: handle.samples()?,
        })
    }));
    let options = ReportOptions {
        row_len: DEFAULT_ROW_LEN,
        fixed_channels: FIXED_CHANNELS,
        interrupts: DMA.interrupt_count(),
        failed: DMA.failed(),
    };

    let mut out = DefmtLines::new();
    if write_report(&mut out, &observer, &options).is_err() {
        defmt::warn!("report line did not fit the line buffer");
    }

    loop {
        cortex_m::asm::wfi();
    }
}

/// Forwards formatted text to defmt one line at a time.
struct DefmtLines {
    line: heapless::String<128>,
}

impl DefmtLines {
    fn new() -> Self {
        Self {
            line: heapless::String::new(),
        }
    }
}

impl Write for DefmtLines {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            if c == '\n' {
                defmt::println!("{=str}", self.line.as_str());
                self.line.clear();
            } else {
                self.line.push(c).map_err(|_| fmt::Error)?;
            }
        }
        Ok(())
    }
}
