use std::{error::Error, io, path::Path};

use crate::{ArbSlots, ChannelId, TriggerSource};

pub const CONFIG_FILE_NAME: &str = "ldma-arbitration.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChannelConfig {
    pub channel: ChannelId,
    #[serde(default)]
    pub slots: ArbSlots,
    #[serde(default)]
    pub trigger: TriggerSource,
    pub count: u32,
    pub block_len: u32,
    #[serde(default)]
    pub interrupt_on_done: bool,
}

impl ChannelConfig {
    pub const fn total_elements(&self) -> usize {
        (self.count * self.block_len) as usize
    }
}

/// Knobs of the hosted LDMA model. Cycles are HFPER clock cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub cycles_per_element: u32,
    pub arbitration_cycles: u32,
    /// TIMER0 overflow period (TOP + 1).
    pub trigger_period: u32,
    pub counter_start: u32,
    /// Whether a block grant consumes the latched TIMER0 request (DMACLRACT).
    pub clear_request_on_transfer: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            cycles_per_element: 4,
            arbitration_cycles: 2,
            trigger_period: 0x1_0000,
            counter_start: 0,
            clear_request_on_transfer: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Config {
    /// Channels below this index use fixed priority instead of round-robin.
    #[serde(default)]
    pub fixed_channels: u8,
    #[serde(default = "Config::default_row_len")]
    pub row_len: usize,
    #[serde(default = "Config::default_timeout_ms")]
    pub timeout_ms: u64,
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Config {
    const fn default_row_len() -> usize {
        32
    }

    const fn default_timeout_ms() -> u64 {
        5_000
    }

    pub fn load(path: Option<&Path>) -> Result<Self, Box<dyn Error>> {
        let paths = match path {
            Some(p) => vec![p.into()],
            None => std::env::current_dir()?
                .ancestors()
                .map(|path| path.join(CONFIG_FILE_NAME))
                .collect(),
        };

        let mut last_error = None;

        for path in paths {
            match std::fs::read_to_string(&path) {
                Ok(config_string) => {
                    log::debug!("Loading config from {}", path.display());
                    let config: Self = toml::from_str(&config_string)?;
                    config.check()?;
                    return Ok(config);
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| io::Error::from(io::ErrorKind::NotFound))
            .into())
    }

    /// Like [`Config::load`], but falls back to the default scenario when no
    /// config file exists.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, Box<dyn Error>> {
        match Self::load(path) {
            Err(e) if path.is_none() && is_not_found(e.as_ref()) => Ok(Self::default()),
            result => result,
        }
    }

    /// Range checks the launcher would otherwise assert on.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.row_len == 0 {
            return Err(ConfigError::RowLen);
        }

        for (i, channel) in self.channels.iter().enumerate() {
            if !(1..0x100).contains(&channel.count) {
                return Err(ConfigError::Count(channel.channel, channel.count));
            }
            if !(1..0x100).contains(&channel.block_len) {
                return Err(ConfigError::BlockLen(channel.channel, channel.block_len));
            }
            if self.channels[..i].iter().any(|c| c.channel == channel.channel) {
                return Err(ConfigError::DuplicateChannel(channel.channel));
            }
        }

        Ok(())
    }
}

fn is_not_found(e: &(dyn Error + 'static)) -> bool {
    e.downcast_ref::<io::Error>()
        .is_some_and(|e| e.kind() == io::ErrorKind::NotFound)
}

impl Default for Config {
    /// Four round-robin channels with weights 0 to 3, four passes of 64 words.
    fn default() -> Self {
        let channels = (2..=5)
            .zip(0..=3)
            .filter_map(|(channel, slots)| {
                Some(ChannelConfig {
                    channel: ChannelId::new(channel)?,
                    slots: ArbSlots::from_bits(slots)?,
                    trigger: TriggerSource::Timer0Overflow,
                    count: 4,
                    block_len: 64,
                    interrupt_on_done: false,
                })
            })
            .collect();

        Self {
            fixed_channels: 0,
            row_len: Self::default_row_len(),
            timeout_ms: Self::default_timeout_ms(),
            channels,
            simulation: SimulationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    RowLen,
    Count(ChannelId, u32),
    BlockLen(ChannelId, u32),
    DuplicateChannel(ChannelId),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::RowLen => write!(f, "row_len must be at least 1"),
            ConfigError::Count(ch, count) => {
                write!(f, "channel {ch}: count {count} is not in 1..256")
            }
            ConfigError::BlockLen(ch, len) => {
                write!(f, "channel {ch}: block_len {len} is not in 1..256")
            }
            ConfigError::DuplicateChannel(ch) => write!(f, "channel {ch} is listed twice"),
        }
    }
}

impl Error for ConfigError {}
