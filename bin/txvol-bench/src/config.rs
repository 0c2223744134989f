//! Bench configuration file
//!
//! Every table and key is optional; missing ones take the defaults below.
//!
//! ```toml
//! [pool]
//! volumes = 8
//! sync_policy = "always"
//!
//! [workload]
//! read_percent = 50
//!
//! [volume]
//! max_active_per_volume = 16
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use txvol_common::{SyncPolicy, VolumeConfig};

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub volume: VolumeConfig,
}

/// Shape of the in-memory pool the bench runs against
#[derive(Clone, Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_name")]
    pub name: String,
    #[serde(default = "default_capacity")]
    pub capacity: u64,
    #[serde(default = "default_volumes")]
    pub volumes: usize,
    #[serde(default = "default_volume_size")]
    pub volume_size: u64,
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// Pool has a separate log device
    #[serde(default)]
    pub log_device: bool,
    /// Complete log commits on a background thread
    #[serde(default = "default_true")]
    pub async_commit: bool,
    #[serde(default = "default_sync_policy")]
    pub sync_policy: SyncPolicy,
    /// Interval of the background transaction group sync
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: default_pool_name(),
            capacity: default_capacity(),
            volumes: default_volumes(),
            volume_size: default_volume_size(),
            block_size: default_block_size(),
            log_device: false,
            async_commit: true,
            sync_policy: default_sync_policy(),
            sync_interval_ms: default_sync_interval_ms(),
        }
    }
}

/// Request mix issued against every volume
#[derive(Clone, Debug, Deserialize)]
pub struct WorkloadConfig {
    #[serde(default = "default_io_size")]
    pub io_size: u64,
    #[serde(default = "default_ops_per_volume")]
    pub ops_per_volume: u64,
    /// Outstanding requests per volume
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_read_percent")]
    pub read_percent: u8,
    /// Share of writes issued with the synchronous flag
    #[serde(default = "default_sync_percent")]
    pub sync_percent: u8,
    #[serde(default)]
    pub seed: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            io_size: default_io_size(),
            ops_per_volume: default_ops_per_volume(),
            queue_depth: default_queue_depth(),
            read_percent: default_read_percent(),
            sync_percent: default_sync_percent(),
            seed: 0,
        }
    }
}

fn default_pool_name() -> String {
    "bench".to_string()
}

fn default_capacity() -> u64 {
    64 * 1024 * 1024 * 1024
}

fn default_volumes() -> usize {
    4
}

fn default_volume_size() -> u64 {
    64 * 1024 * 1024
}

fn default_block_size() -> u64 {
    16 * 1024
}

fn default_true() -> bool {
    true
}

fn default_sync_policy() -> SyncPolicy {
    SyncPolicy::Standard
}

fn default_sync_interval_ms() -> u64 {
    100
}

fn default_io_size() -> u64 {
    16 * 1024
}

fn default_ops_per_volume() -> u64 {
    20_000
}

fn default_queue_depth() -> usize {
    16
}

fn default_read_percent() -> u8 {
    70
}

fn default_sync_percent() -> u8 {
    10
}

impl Config {
    /// Load `path`, or the defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self =
            toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.volume.validate().context("invalid [volume] table")?;
        let w = &self.workload;
        anyhow::ensure!(self.pool.volumes > 0, "pool.volumes must be at least 1");
        anyhow::ensure!(w.io_size > 0, "workload.io_size must be non-zero");
        anyhow::ensure!(w.queue_depth > 0, "workload.queue_depth must be at least 1");
        anyhow::ensure!(
            w.read_percent <= 100 && w.sync_percent <= 100,
            "workload percentages must not exceed 100"
        );
        anyhow::ensure!(
            self.pool.volume_size >= w.io_size,
            "pool.volume_size {} is smaller than workload.io_size {}",
            self.pool.volume_size,
            w.io_size
        );
        Ok(())
    }
}
