//! txvol Bench
//!
//! Builds an in-memory pool, attaches its volumes through the volume layer
//! and drives a concurrent read/write mix through the admission engine,
//! reporting throughput, submitter latency percentiles and per-volume
//! counters.

mod config;
mod workload;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::workload::Bench;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "txvol-bench", about = "Block I/O load generator for txvol")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "txvol-bench.toml")]
    config: PathBuf,

    /// Number of volumes (overrides pool.volumes)
    #[arg(long)]
    volumes: Option<usize>,

    /// Requests per volume (overrides workload.ops_per_volume)
    #[arg(long)]
    ops: Option<u64>,

    /// Request size in bytes (overrides workload.io_size)
    #[arg(long)]
    io_size: Option<u64>,

    /// Outstanding requests per volume (overrides workload.queue_depth)
    #[arg(long)]
    queue_depth: Option<usize>,

    /// Percentage of reads (overrides workload.read_percent)
    #[arg(long)]
    read_percent: Option<u8>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Log level (trace / debug / info / warn / error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// CLI values take precedence over the file
    fn apply(&self, config: &mut Config) {
        if let Some(v) = self.volumes {
            config.pool.volumes = v;
        }
        if let Some(v) = self.ops {
            config.workload.ops_per_volume = v;
        }
        if let Some(v) = self.io_size {
            config.workload.io_size = v;
        }
        if let Some(v) = self.queue_depth {
            config.workload.queue_depth = v;
        }
        if let Some(v) = self.read_percent {
            config.workload.read_percent = v;
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = Config::load(&args.config)?;
    args.apply(&mut config);
    config.validate().context("invalid bench settings")?;

    info!(
        config = %args.config.display(),
        volumes = config.pool.volumes,
        ops_per_volume = config.workload.ops_per_volume,
        io_size = config.workload.io_size,
        queue_depth = config.workload.queue_depth,
        "Starting txvol bench"
    );

    let bench = Bench::setup(&config)?;
    let report = workload::run(&bench, &config).await?;
    bench.teardown(&config.pool.name).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_file() {
        let args = Args::parse_from([
            "txvol-bench",
            "--volumes",
            "3",
            "--read-percent",
            "0",
            "--json",
        ]);
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.pool.volumes, 3);
        assert_eq!(config.workload.read_percent, 0);
        assert_eq!(config.workload.io_size, 16 * 1024);
        assert!(args.json);
        assert_eq!(args.log_level, "info");
    }
}
