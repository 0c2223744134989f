//! Configuration types for txvol
//!
//! Tunables of the volume layer. Every field has a default so a partial
//! TOML table deserializes into a complete configuration.

use crate::error::{Error, Result};
use crate::types::VolMode;
use serde::{Deserialize, Serialize};

/// Tunables of the volume layer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Maximum admitted asynchronous requests per volume
    #[serde(default = "default_parallelism")]
    pub max_active_per_volume: usize,
    /// Maximum requests waiting for admission per volume
    #[serde(default = "default_max_deferred")]
    pub max_deferred_per_volume: usize,
    /// Threads executing transactional work
    #[serde(default = "default_parallelism")]
    pub worker_threads: usize,
    /// Threads triaging requests handed off by callers that cannot block
    #[serde(default = "default_triage_threads")]
    pub triage_threads: usize,
    /// Writes at least this large are logged by reference
    #[serde(default = "default_immediate_write_size")]
    pub immediate_write_size: u64,
    /// Largest chunk moved by one character-device transfer step
    #[serde(default = "default_max_transfer")]
    pub max_transfer: u64,
    /// Presentation used when a volume's mode is `default`
    #[serde(default = "default_volmode")]
    pub default_volmode: VolMode,
    /// Advertise and honour discard requests
    #[serde(default = "default_true")]
    pub unmap_enabled: bool,
    /// Discard intent logs at attach instead of replaying them
    #[serde(default)]
    pub replay_disable: bool,
    /// Attach volumes without creating any presentation
    #[serde(default)]
    pub inhibit_dev: bool,
    /// Largest block size the pool accepts
    #[serde(default = "default_max_recordsize")]
    pub max_recordsize: u64,
    /// Block size of newly created volumes
    #[serde(default = "default_volblocksize")]
    pub default_volblocksize: u64,
    /// Pool has the large-blocks feature enabled
    #[serde(default = "default_true")]
    pub large_blocks: bool,
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

fn default_max_deferred() -> usize {
    4096
}

fn default_triage_threads() -> usize {
    1
}

fn default_immediate_write_size() -> u64 {
    32 * 1024
}

fn default_max_transfer() -> u64 {
    32 * 1024 * 1024
}

fn default_volmode() -> VolMode {
    VolMode::Geom
}

fn default_true() -> bool {
    true
}

fn default_max_recordsize() -> u64 {
    1024 * 1024
}

fn default_volblocksize() -> u64 {
    16 * 1024
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            max_active_per_volume: default_parallelism(),
            max_deferred_per_volume: default_max_deferred(),
            worker_threads: default_parallelism(),
            triage_threads: default_triage_threads(),
            immediate_write_size: default_immediate_write_size(),
            max_transfer: default_max_transfer(),
            default_volmode: default_volmode(),
            unmap_enabled: true,
            replay_disable: false,
            inhibit_dev: false,
            max_recordsize: default_max_recordsize(),
            default_volblocksize: default_volblocksize(),
            large_blocks: true,
        }
    }
}

impl VolumeConfig {
    /// Reject configurations the engine cannot run with
    ///
    /// # Errors
    /// Returns `InvalidArgument` naming the offending key.
    pub fn validate(&self) -> Result<()> {
        if self.max_active_per_volume == 0 {
            return Err(Error::invalid_argument("max_active_per_volume must be >= 1"));
        }
        if self.worker_threads == 0 {
            return Err(Error::invalid_argument("worker_threads must be >= 1"));
        }
        if self.triage_threads == 0 {
            return Err(Error::invalid_argument("triage_threads must be >= 1"));
        }
        if self.max_transfer == 0 {
            return Err(Error::invalid_argument("max_transfer must be >= 1"));
        }
        if !self.default_volblocksize.is_power_of_two() {
            return Err(Error::invalid_argument(
                "default_volblocksize must be a power of two",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = VolumeConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.max_active_per_volume >= 1);
        assert_eq!(config.immediate_write_size, 32768);
        assert_eq!(config.default_volmode, VolMode::Geom);
    }

    #[test]
    fn test_zero_cap_rejected() {
        let config = VolumeConfig {
            max_active_per_volume: 0,
            ..VolumeConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_serde_defaults_fill_missing_keys() {
        let config: VolumeConfig =
            serde_json::from_str(r#"{"max_active_per_volume": 2, "default_volmode": "dev"}"#)
                .unwrap();
        assert_eq!(config.max_active_per_volume, 2);
        assert_eq!(config.default_volmode, VolMode::Dev);
        assert!(config.unmap_enabled);
        assert_eq!(config.max_deferred_per_volume, 4096);
    }
}
