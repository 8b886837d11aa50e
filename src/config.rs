//! Configuration management.
//!
//! Settings are loaded from TOML through the `config` crate and validated
//! semantically before anything touches the card. The channel list is
//! static: channels are built once at configuration time and the router
//! table never changes afterwards.

use config::Config;
use serde::Deserialize;
use std::time::Duration;

use crate::card::CardSelector;
use crate::channel::ChannelConfig;
use crate::checksum::Polynomial;
use crate::error::{AppResult, IngestError};
use crate::ring::RingConfig;
use crate::sink::OverflowPolicy;

/// Top-level settings.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Device endpoint selection.
    #[serde(default)]
    pub card: CardSettings,
    /// Ring engine parameters.
    pub ring: RingSettings,
    /// Frame codec parameters shared by all channels.
    #[serde(default)]
    pub framing: FramingSettings,
    /// Enabled channel list.
    pub channels: Vec<ChannelSettings>,
}

/// Device endpoint selection.
#[derive(Debug, Deserialize, Clone, Copy, Default)]
pub struct CardSettings {
    /// Device index on the host.
    #[serde(default)]
    pub device_id: u32,
    /// Logical unit within the device.
    #[serde(default)]
    pub logical_unit: u32,
    /// NUMA node for the DMA region allocation.
    #[serde(default)]
    pub numa_node: u8,
}

/// Ring engine parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct RingSettings {
    /// DMA descriptor to drive.
    #[serde(default)]
    pub dma_id: u8,
    /// Ring size in bytes; must be a whole number of blocks.
    pub memory_bytes: u64,
    /// Block size in bytes.
    #[serde(default = "default_block_bytes")]
    pub block_bytes: u32,
    /// Blocks held back from reclamation.
    #[serde(default = "default_margin_blocks")]
    pub margin_blocks: u32,
    /// Minimum available blocks before draining.
    #[serde(default = "default_threshold_blocks")]
    pub threshold_blocks: u32,
    /// Wait on the card notification instead of polling.
    #[serde(default)]
    pub interrupt_mode: bool,
    /// Sleep between pointer polls, e.g. `"2ms"`.
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Arm the descriptor in wrap-around mode.
    #[serde(default = "default_true")]
    pub wraparound: bool,
}

/// Frame codec parameters.
#[derive(Debug, Deserialize, Clone, Copy, Default)]
pub struct FramingSettings {
    /// Checksum polynomial the front end is configured with.
    #[serde(default)]
    pub polynomial: Polynomial,
}

/// One channel entry.
#[derive(Debug, Deserialize, Clone)]
pub struct ChannelSettings {
    /// Channel id as carried in block headers.
    pub id: u16,
    /// Disabled channels are skipped at build time.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Inbound block-address queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Chunk sink capacity.
    #[serde(default = "default_sink_capacity")]
    pub sink_capacity: usize,
    /// Sink overflow policy.
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    /// Deliver checksum-failed chunks (marked invalid) instead of only
    /// counting them.
    #[serde(default)]
    pub forward_invalid: bool,
}

fn default_block_bytes() -> u32 {
    4096
}
fn default_margin_blocks() -> u32 {
    4
}
fn default_threshold_blocks() -> u32 {
    1
}
fn default_poll_interval() -> Duration {
    Duration::from_millis(2)
}
fn default_true() -> bool {
    true
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_sink_capacity() -> usize {
    256
}

impl Settings {
    /// Load `config/<name>.toml` (default `config/default.toml`).
    pub fn new(config_name: Option<&str>) -> AppResult<Self> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        Self::load_from(&config_path)
    }

    /// Load settings from an explicit file path (extension optional).
    pub fn load_from(path: &str) -> AppResult<Self> {
        let s = Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .map_err(IngestError::Config)?;
        let settings: Settings = s.try_deserialize().map_err(IngestError::Config)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic validation beyond what deserialization enforces.
    pub fn validate(&self) -> AppResult<()> {
        let ring = &self.ring;
        if ring.block_bytes < 16 || ring.block_bytes % 8 != 0 {
            return Err(IngestError::Configuration(format!(
                "block_bytes {} must be a multiple of 8 and at least 16",
                ring.block_bytes
            )));
        }
        if ring.memory_bytes == 0 || ring.memory_bytes % u64::from(ring.block_bytes) != 0 {
            return Err(IngestError::Configuration(format!(
                "memory_bytes {} must be a non-zero multiple of block_bytes {}",
                ring.memory_bytes, ring.block_bytes
            )));
        }
        let nblocks = ring.memory_bytes / u64::from(ring.block_bytes);
        if u64::from(ring.margin_blocks) >= nblocks {
            return Err(IngestError::Configuration(format!(
                "margin_blocks {} must be below the block count {}",
                ring.margin_blocks, nblocks
            )));
        }
        if ring.threshold_blocks == 0 || u64::from(ring.threshold_blocks) > nblocks {
            return Err(IngestError::Configuration(format!(
                "threshold_blocks {} must be within 1..={}",
                ring.threshold_blocks, nblocks
            )));
        }
        if self.channels.is_empty() {
            return Err(IngestError::Configuration("no channels configured".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for ch in &self.channels {
            if !seen.insert(ch.id) {
                return Err(IngestError::Configuration(format!(
                    "duplicate channel id {}",
                    ch.id
                )));
            }
            if ch.queue_capacity == 0 || ch.sink_capacity == 0 {
                return Err(IngestError::Configuration(format!(
                    "channel {} queue and sink capacities must be non-zero",
                    ch.id
                )));
            }
        }
        Ok(())
    }

    /// Card endpoint selector.
    #[must_use]
    pub fn selector(&self) -> CardSelector {
        CardSelector {
            device_id: self.card.device_id,
            logical_unit: self.card.logical_unit,
        }
    }

    /// Ring engine configuration.
    #[must_use]
    pub fn ring_config(&self) -> RingConfig {
        RingConfig {
            dma_id: self.ring.dma_id,
            memory_bytes: self.ring.memory_bytes,
            block_bytes: self.ring.block_bytes,
            margin_blocks: self.ring.margin_blocks,
            threshold_blocks: self.ring.threshold_blocks,
            interrupt_mode: self.ring.interrupt_mode,
            poll_interval: self.ring.poll_interval,
            numa_node: self.card.numa_node,
            wraparound: self.ring.wraparound,
        }
    }

    /// Per-channel configurations for the enabled channels.
    #[must_use]
    pub fn channel_configs(&self) -> Vec<ChannelConfig> {
        self.channels
            .iter()
            .filter(|ch| ch.enabled)
            .map(|ch| ChannelConfig {
                id: ch.id,
                block_bytes: self.ring.block_bytes as usize,
                queue_capacity: ch.queue_capacity,
                sink_capacity: ch.sink_capacity,
                overflow_policy: ch.overflow_policy,
                forward_invalid: ch.forward_invalid,
                polynomial: self.framing.polynomial,
            })
            .collect()
    }
}
