use core::fmt::{self, Write};

use ldma_core::ChannelMask;

use crate::{Row, TraceObserver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportOptions {
    pub row_len: usize,
    /// Channels below this index were configured with fixed priority.
    pub fixed_channels: u8,
    /// Completion interrupts taken while the channels ran.
    pub interrupts: u32,
    pub failed: ChannelMask,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            row_len: crate::DEFAULT_ROW_LEN,
            fixed_channels: 0,
            interrupts: 0,
            failed: ChannelMask::EMPTY,
        }
    }
}

/// Writes the terminal view of the trace: one row per `row_len` elements,
/// indented by lane so each channel gets its own column.
pub fn write_report<W: Write>(
    w: &mut W,
    observer: &TraceObserver<'_>,
    options: &ReportOptions,
) -> fmt::Result {
    writeln!(
        w,
        "Start --- Each row represents {} words transfered; channels below {} are fixed",
        options.row_len, options.fixed_channels
    )?;

    let mut result = Ok(());
    observer.feed(options.row_len, |row| {
        if result.is_ok() {
            result = write_row(w, &row);
        }
    });
    result?;

    if options.interrupts > 0 {
        writeln!(w, "Interrupt handler was called {} times", options.interrupts)?;
    }

    for channel in options.failed.iter() {
        writeln!(w, "Channel {channel} failed: transfer error")?;
    }

    Ok(())
}

pub fn write_row<W: Write>(w: &mut W, row: &Row) -> fmt::Result {
    for _ in 0..4 * row.lane {
        w.write_char(' ')?;
    }
    for _ in 0..4 {
        write!(w, "{}", row.channel)?;
    }
    w.write_char('\n')
}

/// One `value channel` line per sample, lane after lane, for plotting.
pub fn write_plot<W: Write>(w: &mut W, observer: &TraceObserver<'_>) -> fmt::Result {
    for lane in observer.lanes() {
        for value in lane.samples {
            writeln!(w, "{} {}", value, lane.channel)?;
        }
    }
    Ok(())
}
