//! Runs a configured set of channels against the simulated LDMA and keeps
//! what they recorded.

use std::error::Error;

use ldma_core::{
    board::WTIMER0_CNT,
    config::{ChannelConfig, Config},
    descriptor::ChainSlot,
    ChannelId, ChannelMask,
};
use ldma_firmware::{timer::Duration, Dma, TransferRequest, UNWRITTEN};
use trace_observer::{
    report::{write_plot, write_report, ReportOptions},
    Lane, TraceObserver, MAX_LANES,
};

use crate::{Grant, SimulatedLdma};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedLane {
    pub channel: ChannelId,
    /// Empty when the channel did not complete.
    pub samples: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub lanes: Vec<CapturedLane>,
    pub grants: Vec<Grant>,
    pub interrupts: u32,
    pub failed: ChannelMask,
    pub result: Result<(), ldma_firmware::Error>,
}

impl Capture {
    pub fn observer(&self) -> TraceObserver<'_> {
        TraceObserver::new(self.lanes.iter().map(|lane| Lane {
            channel: lane.channel,
            samples: &lane.samples,
        }))
    }

    pub fn report(&self, config: &Config) -> String {
        let options = ReportOptions {
            row_len: config.row_len,
            fixed_channels: config.fixed_channels,
            interrupts: self.interrupts,
            failed: self.failed,
        };

        let mut out = String::new();
        // Writing into a String does not fail.
        let _ = write_report(&mut out, &self.observer(), &options);
        out
    }

    pub fn plot(&self) -> String {
        let mut out = String::new();
        let _ = write_plot(&mut out, &self.observer());
        out
    }
}

pub fn request(channel: &ChannelConfig) -> TransferRequest {
    TransferRequest::new(channel.channel, WTIMER0_CNT, channel.count, channel.block_len)
        .slots(channel.slots)
        .trigger(channel.trigger)
        .interrupt_on_done(channel.interrupt_on_done)
}

/// Runs `config` on a fresh simulated controller.
pub fn run(config: &Config) -> Result<Capture, Box<dyn Error>> {
    let dma = Dma::new(SimulatedLdma::new(config.fixed_channels, config.simulation));
    run_on(&dma, config)
}

/// Runs `config` on an existing driver. The controller's grant log is
/// drained, so consecutive runs capture only their own grants.
pub fn run_on(dma: &Dma<SimulatedLdma>, config: &Config) -> Result<Capture, Box<dyn Error>> {
    config.check()?;
    if config.channels.len() > MAX_LANES {
        return Err(format!("at most {MAX_LANES} channels can be traced at once").into());
    }

    let mut clock = dma.access(|sim| {
        sim.take_grants();
        sim.clock()
    });
    let interrupts_before = dma.interrupt_count();

    let mut slots = vec![ChainSlot::new(); config.channels.len()];
    let mut buffers: Vec<Vec<u32>> = config
        .channels
        .iter()
        .map(|channel| vec![UNWRITTEN; channel.total_elements()])
        .collect();

    let handles = config
        .channels
        .iter()
        .zip(&mut slots)
        .zip(&mut buffers)
        .map(|((channel, slot), buffer)| dma.begin_transfer(request(channel), slot, buffer))
        .collect::<Result<Vec<_>, _>>()?;

    let running: ChannelMask = config.channels.iter().map(|c| c.channel).collect();
    log::debug!("waiting for channels {:#x}", running.bits());
    let result = dma.wait(running, &mut clock, Duration::millis(config.timeout_ms));

    let lanes = handles
        .iter()
        .map(|handle| CapturedLane {
            channel: handle.channel(),
            samples: handle.samples().map(<[u32]>::to_vec).unwrap_or_default(),
        })
        .collect();
    drop(handles);

    Ok(Capture {
        lanes,
        grants: dma.access(|sim| sim.take_grants()),
        interrupts: dma.interrupt_count() - interrupts_before,
        failed: dma.failed().intersection(running),
        result,
    })
}
