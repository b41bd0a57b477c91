use ldma_core::board::{
    CMU_BASE, CMU_HFPERCLKEN0, CMU_HFPERCLKEN0_TIMER0, CMU_HFPERCLKEN0_WTIMER0, HFPERCLK_HZ,
    TIMER0_BASE, TIMER_CMD, TIMER_CMD_START, TIMER_CMD_STOP, TIMER_CNT, TIMER_CTRL, TIMER_TOP,
    WTIMER0_BASE, WTIMER0_CNT,
};

use crate::mmio;

pub const TICK_HZ: u32 = 1_000_000;

pub type Instant = fugit::TimerInstantU64<TICK_HZ>;
pub type Duration = fugit::TimerDurationU64<TICK_HZ>;

/// Monotonic time source for deadlines.
pub trait Clock {
    fn now(&mut self) -> Instant;
}

/// Starts TIMER0 counting up to `top` and wrapping. Every wrap raises the
/// overflow request the harness channels are triggered by.
///
/// # Safety
///
/// Takes over TIMER0 without any ownership tracking.
pub unsafe fn start_trigger_timer(top: u16) {
    start_timer(TIMER0_BASE, CMU_HFPERCLKEN0_TIMER0, top as u32);
}

/// Starts WTIMER0 as a free-running 32-bit counter, the value the harness
/// channels copy into memory.
///
/// # Safety
///
/// Takes over WTIMER0 without any ownership tracking.
pub unsafe fn start_sample_counter() {
    start_timer(WTIMER0_BASE, CMU_HFPERCLKEN0_WTIMER0, u32::MAX);
}

unsafe fn start_timer(base: u32, clock_enable: u32, top: u32) {
    mmio::modify(CMU_BASE + CMU_HFPERCLKEN0, |v| v | clock_enable);
    mmio::write(base + TIMER_CMD, TIMER_CMD_STOP);
    // Up-count mode, DMACLRACT off.
    mmio::write(base + TIMER_CTRL, 0);
    mmio::write(base + TIMER_TOP, top);
    mmio::write(base + TIMER_CNT, 0);
    mmio::write(base + TIMER_CMD, TIMER_CMD_START);
}

/// A [`Clock`] on top of the WTIMER0 sample counter. The counter is
/// extended to 64 bits in software, so `now` has to be called at least once
/// per counter period (about 226 s at the reset HFPER clock).
pub struct WideTimerClock {
    last: u32,
    wraps: u64,
}

impl WideTimerClock {
    /// # Safety
    ///
    /// WTIMER0 must have been started with [`start_sample_counter`].
    pub unsafe fn new() -> Self {
        Self { last: 0, wraps: 0 }
    }

    fn extend(&mut self, count: u32) -> Instant {
        if count < self.last {
            self.wraps += 1;
        }
        self.last = count;

        let cycles = (self.wraps << 32) | count as u64;
        Instant::from_ticks(cycles * TICK_HZ as u64 / HFPERCLK_HZ as u64)
    }
}

impl Clock for WideTimerClock {
    fn now(&mut self) -> Instant {
        // SAFETY: reading the counter has no side effects
        let count = unsafe { mmio::read(WTIMER0_CNT) };
        self.extend(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extends_across_wraps() {
        let mut clock = WideTimerClock { last: 0, wraps: 0 };

        assert_eq!(clock.extend(HFPERCLK_HZ).ticks(), 1_000_000);
        let before = clock.extend(u32::MAX);
        let after = clock.extend(HFPERCLK_HZ);
        assert!(after > before);
        assert_eq!(
            after.ticks(),
            ((1u64 << 32) + HFPERCLK_HZ as u64) * 1_000_000 / HFPERCLK_HZ as u64
        );
    }

    #[test]
    fn deadlines() {
        let start = Instant::from_ticks(10);
        let deadline = start + Duration::millis(5);
        assert_eq!(deadline.ticks(), 5_010);
        assert!(Instant::from_ticks(5_010) >= deadline);
    }
}
