#![cfg_attr(not(any(test, feature = "std")), no_std)]

use core::fmt;

pub mod board;
#[cfg(feature = "config")]
pub mod config;
pub mod descriptor;

/// Number of LDMA channels on the EFM32GG11.
pub const MAX_CHANNELS: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(try_from = "u8", into = "u8")]
pub struct ChannelId(u8);

impl ChannelId {
    pub const fn new(index: u8) -> Option<Self> {
        if (index as usize) < MAX_CHANNELS {
            Some(Self(index))
        } else {
            None
        }
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn mask(self) -> ChannelMask {
        ChannelMask(1 << self.0)
    }
}

impl TryFrom<u8> for ChannelId {
    type Error = InvalidChannel;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidChannel(value))
    }
}

impl From<ChannelId> for u8 {
    fn from(value: ChannelId) -> Self {
        value.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidChannel(pub u8);

impl fmt::Display for InvalidChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel {} does not exist (max {})", self.0, MAX_CHANNELS - 1)
    }
}

/// A set of channels, laid out like the CHEN register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelMask(pub u32);

impl ChannelMask {
    pub const EMPTY: Self = Self(0);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, channel: ChannelId) -> bool {
        self.0 & (1 << channel.0) != 0
    }

    pub fn insert(&mut self, channel: ChannelId) {
        self.0 |= 1 << channel.0;
    }

    pub fn remove(&mut self, channel: ChannelId) {
        self.0 &= !(1 << channel.0);
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = ChannelId> {
        (0..MAX_CHANNELS as u8)
            .filter(move |i| self.0 & (1 << i) != 0)
            .map(ChannelId)
    }
}

impl FromIterator<ChannelId> for ChannelMask {
    fn from_iter<T: IntoIterator<Item = ChannelId>>(iter: T) -> Self {
        let mut mask = Self::EMPTY;
        for channel in iter {
            mask.insert(channel);
        }
        mask
    }
}

/// Arbitration slots a round-robin channel is granted before the arbiter
/// moves on. The discriminant is the CFG.ARBSLOTS encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(try_from = "u8", into = "u8")]
pub enum ArbSlots {
    #[default]
    One = 0,
    Two = 1,
    Four = 2,
    Eight = 3,
}

impl ArbSlots {
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::One),
            1 => Some(Self::Two),
            2 => Some(Self::Four),
            3 => Some(Self::Eight),
            _ => None,
        }
    }

    pub const fn bits(self) -> u8 {
        self as u8
    }

    pub const fn slots(self) -> u32 {
        1 << self.bits()
    }
}

impl TryFrom<u8> for ArbSlots {
    type Error = InvalidArbSlots;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_bits(value).ok_or(InvalidArbSlots(value))
    }
}

impl From<ArbSlots> for u8 {
    fn from(value: ArbSlots) -> Self {
        value.bits()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidArbSlots(pub u8);

impl fmt::Display for InvalidArbSlots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arbitration slot encoding {} is not in 0..=3", self.0)
    }
}

/// The request line a channel waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TriggerSource {
    /// No peripheral request, the head descriptor requests itself on load.
    Software,
    /// TIMER0 overflow/underflow.
    #[default]
    Timer0Overflow,
    Peripheral { source: u8, signal: u8 },
}

impl TriggerSource {
    /// The CHx_REQSEL register value.
    pub const fn reqsel(self) -> u32 {
        match self {
            TriggerSource::Software => 0,
            TriggerSource::Timer0Overflow => (board::REQSEL_SOURCE_TIMER0 as u32) << 16,
            TriggerSource::Peripheral { source, signal } => {
                ((source as u32 & 0x3F) << 16) | (signal as u32 & 0xF)
            }
        }
    }
}

/// A snapshot of the free-running sample counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CounterValue(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TraceSample {
    pub channel: ChannelId,
    /// Position within the channel's own buffer.
    pub seq: usize,
    pub value: CounterValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_bounds() {
        assert!(ChannelId::new(23).is_some());
        assert!(ChannelId::new(24).is_none());
        assert_eq!(ChannelId::try_from(30), Err(InvalidChannel(30)));
    }

    #[test]
    fn mask_ops() {
        let ch = |i| ChannelId::new(i).unwrap();
        let mut mask: ChannelMask = [ch(2), ch(5)].into_iter().collect();
        assert_eq!(mask.bits(), 0b10_0100);
        assert!(mask.contains(ch(5)));

        mask.remove(ch(5));
        mask.insert(ch(3));
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![ch(2), ch(3)]);
        assert_eq!(mask.difference(ch(2).mask()), ch(3).mask());
        assert!(mask.intersection(ch(7).mask()).is_empty());
    }

    #[test]
    fn arb_slots_encoding() {
        assert_eq!(ArbSlots::from_bits(0).map(ArbSlots::slots), Some(1));
        assert_eq!(ArbSlots::from_bits(3).map(ArbSlots::slots), Some(8));
        assert_eq!(ArbSlots::from_bits(4), None);
        assert_eq!(ArbSlots::try_from(9), Err(InvalidArbSlots(9)));
    }

    #[test]
    fn reqsel() {
        assert_eq!(TriggerSource::Software.reqsel(), 0);
        assert_eq!(TriggerSource::Timer0Overflow.reqsel(), 0x19 << 16);
        assert_eq!(
            TriggerSource::Peripheral {
                source: 0x1A,
                signal: 2,
            }
            .reqsel(),
            0x1A << 16 | 2
        );
    }
}
