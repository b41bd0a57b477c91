use core::fmt;

use ldma_core::{descriptor::ChainError, ChannelId, ChannelMask};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The built descriptor chain failed validation.
    Chain(ChainError),
    /// The controller halted the channel on a bus or descriptor error.
    Transfer { channel: ChannelId },
    /// The channel was stopped before its chain completed.
    Stopped { channel: ChannelId },
    /// The deadline passed while these channels were still running.
    Timeout { pending: ChannelMask },
    HandlerSlotsFull,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Chain(e) => write!(f, "invalid descriptor chain: {e}"),
            Error::Transfer { channel } => write!(f, "transfer error on channel {channel}"),
            Error::Stopped { channel } => write!(f, "channel {channel} was stopped"),
            Error::Timeout { pending } => {
                write!(f, "timed out waiting for channels {:#x}", pending.bits())
            }
            Error::HandlerSlotsFull => write!(f, "no free completion handler slots"),
        }
    }
}

impl core::error::Error for Error {}

impl From<ChainError> for Error {
    fn from(value: ChainError) -> Self {
        Error::Chain(value)
    }
}
