//! EFM32GG11 (Series 1) addresses and field encodings used by the harness.

pub const LDMA_BASE: u32 = 0x4000_2000;
pub const TIMER0_BASE: u32 = 0x4001_8000;
pub const WTIMER0_BASE: u32 = 0x4001_A000;
pub const CMU_BASE: u32 = 0x400E_4000;

pub const TIMER_CTRL: u32 = 0x000;
pub const TIMER_CMD: u32 = 0x004;
pub const TIMER_TOP: u32 = 0x01C;
pub const TIMER_CNT: u32 = 0x024;
pub const TIMER_CMD_START: u32 = 1 << 0;
pub const TIMER_CMD_STOP: u32 = 1 << 1;

pub const CMU_HFPERCLKEN0: u32 = 0x0C0;
pub const CMU_HFPERCLKEN0_TIMER0: u32 = 1 << 0;
pub const CMU_HFPERCLKEN0_WTIMER0: u32 = 1 << 4;
pub const CMU_HFBUSCLKEN0: u32 = 0x0B0;
pub const CMU_HFBUSCLKEN0_LDMA: u32 = 1 << 2;

/// Register the sample counter is read from.
pub const WTIMER0_CNT: u32 = WTIMER0_BASE + TIMER_CNT;

/// PRS/peripheral request source number of TIMER0 in CHx_REQSEL.
pub const REQSEL_SOURCE_TIMER0: u8 = 0x19;

/// HFPER clock after reset, in Hz.
pub const HFPERCLK_HZ: u32 = 19_000_000;
