//! Configuration types for lsvol
//!
//! The orchestrating process builds an [`EngineConfig`] (directly or from
//! a TOML document) and hands it to the volume at construction time.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What to do when a device or log write fails during a flush or recovery
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FatalAction {
    /// Abort the process
    #[default]
    Abort,
    /// Poison the engine so every later request fails with `Halted`
    Halt,
}

/// Engine configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Addressable size of the volume in blocks
    pub volume_size_blocks: u64,
    /// Block size in bytes (power of two, at least 512)
    pub block_size: u32,
    /// Maximum resident bytes in the block cache
    pub cache_capacity_bytes: u64,
    /// Time between timer-driven checkpoints
    #[serde(with = "duration_secs")]
    pub checkpoint_interval: Duration,
    /// Dirty cache bytes that trigger an early checkpoint
    pub checkpoint_dirty_threshold: u64,
    /// Maximum admitted volume requests; further requests queue
    pub max_outstanding_ios: usize,
    /// Reaction to a device error during checkpoint flush or recovery
    pub fatal_action: FatalAction,
    /// Allow a write to be satisfied by several non-contiguous extents
    pub allocation_split: bool,
    /// Log records appended since the last compaction that trigger a
    /// rewrite of the metadata log as a snapshot; 0 disables compaction
    pub log_compact_records: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            volume_size_blocks: 65536, // 256MB at 4KB blocks
            block_size: 4096,
            cache_capacity_bytes: 64 * 1024 * 1024, // 64MB
            checkpoint_interval: Duration::from_secs(5),
            checkpoint_dirty_threshold: 16 * 1024 * 1024, // 16MB
            max_outstanding_ios: 64,
            fatal_action: FatalAction::Abort,
            allocation_split: true,
            log_compact_records: 65536,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| Error::Configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.block_size < 512 || !self.block_size.is_power_of_two() {
            return Err(Error::Configuration(format!(
                "block_size must be a power of two >= 512, got {}",
                self.block_size
            )));
        }
        if self.volume_size_blocks == 0 {
            return Err(Error::Configuration(
                "volume_size_blocks must be positive".into(),
            ));
        }
        if self.cache_capacity_bytes < u64::from(self.block_size) {
            return Err(Error::Configuration(format!(
                "cache_capacity_bytes {} is smaller than one block",
                self.cache_capacity_bytes
            )));
        }
        if self.checkpoint_interval.is_zero() {
            return Err(Error::Configuration(
                "checkpoint_interval must be positive".into(),
            ));
        }
        if self.max_outstanding_ios == 0 {
            return Err(Error::Configuration(
                "max_outstanding_ios must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Volume size in bytes
    #[must_use]
    pub const fn volume_size_bytes(&self) -> u64 {
        self.volume_size_blocks * self.block_size as u64
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("interval must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
