//! Pool setup and the I/O driver

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info};
use txvol_volume::{
    IoStatsSnapshot, LatencyHistogram, MemPool, OpenFlags, RecordingFactory, Volume,
    VolumeManager,
};

use crate::config::{Config, PoolConfig, WorkloadConfig};

/// An attached, open set of volumes on a fresh in-memory pool
pub struct Bench {
    pub pool: MemPool,
    pub manager: Arc<VolumeManager>,
    pub volumes: Vec<Arc<Volume>>,
}

fn volume_name(pool: &PoolConfig, idx: usize) -> String {
    format!("{}/vol{idx}", pool.name)
}

impl Bench {
    /// Create the pool and its volumes, attach them and open them read-write
    pub fn setup(config: &Config) -> Result<Self> {
        let pc = &config.pool;
        let pool = MemPool::new(&pc.name, pc.capacity);
        pool.set_log_device(pc.log_device);
        pool.set_async_commit(pc.async_commit);
        for idx in 0..pc.volumes {
            let name = volume_name(pc, idx);
            pool.create_volume(&name, pc.volume_size, pc.block_size)
                .with_context(|| format!("create volume {name}"))?;
            pool.set_sync_policy(&name, pc.sync_policy)?;
        }

        let manager = VolumeManager::new(
            config.volume.clone(),
            Arc::new(pool.clone()),
            Arc::new(RecordingFactory::new()),
        )
        .context("start volume manager")?;
        manager
            .create_minors_recursive(&pc.name)
            .context("attach volumes")?;

        let mut volumes = Vec::with_capacity(pc.volumes);
        for idx in 0..pc.volumes {
            let name = volume_name(pc, idx);
            manager
                .open(&name, OpenFlags::read_write())
                .with_context(|| format!("open {name}"))?;
            volumes.push(manager.volume(&name).context("volume was not attached")?);
        }
        info!(
            pool = %pc.name,
            volumes = volumes.len(),
            volume_size = pc.volume_size,
            block_size = pc.block_size,
            "bench pool ready"
        );
        Ok(Self {
            pool,
            manager,
            volumes,
        })
    }

    /// Flush, close and detach every volume
    pub async fn teardown(self, pool_name: &str) -> Result<()> {
        for volume in &self.volumes {
            self.manager.flush(volume).await?;
            self.manager
                .close(&volume.name(), OpenFlags::read_write())
                .with_context(|| format!("close {}", volume.name()))?;
        }
        self.manager.remove_minors(pool_name, true)?;
        self.pool.sync();
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct VolumeReport {
    pub name: String,
    pub stats: IoStatsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub elapsed_ms: u64,
    pub ops: u64,
    pub bytes: u64,
    pub iops: f64,
    pub mib_per_sec: f64,
    /// Latency seen by the submitter, admission wait included
    pub p50_us: u64,
    pub p90_us: u64,
    pub p99_us: u64,
    pub volumes: Vec<VolumeReport>,
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} ops, {} bytes in {} ms: {:.0} IOPS, {:.1} MiB/s",
            self.ops, self.bytes, self.elapsed_ms, self.iops, self.mib_per_sec
        )?;
        writeln!(
            f,
            "latency p50 {} us, p90 {} us, p99 {} us",
            self.p50_us, self.p90_us, self.p99_us
        )?;
        for v in &self.volumes {
            writeln!(
                f,
                "  {:<20} r {:>7} w {:>7} deferred {:>6} range-waits {:>6} log-commits {:>6} errors {}",
                v.name,
                v.stats.read_ops,
                v.stats.write_ops,
                v.stats.deferred,
                v.stats.range_waits,
                v.stats.log_commits,
                v.stats.errors
            )?;
        }
        Ok(())
    }
}

/// One submitter: `ops` requests against one volume, one at a time
async fn drive(
    manager: Arc<VolumeManager>,
    volume: Arc<Volume>,
    workload: Arc<WorkloadConfig>,
    latency: Arc<LatencyHistogram>,
    slots: u64,
    ops: u64,
    seed: u64,
) -> Result<u64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let payload = Bytes::from(vec![(seed % 251) as u8; workload.io_size as usize]);
    let mut bytes = 0;
    for _ in 0..ops {
        let offset = rng.gen_range(0..slots) * workload.io_size;
        let start = Instant::now();
        if rng.gen_range(0..100) < workload.read_percent {
            let data = manager
                .read_at(&volume, offset, workload.io_size)
                .await
                .with_context(|| format!("read {} at {offset}", volume.name()))?;
            bytes += data.len() as u64;
        } else {
            let sync = rng.gen_range(0..100) < workload.sync_percent;
            bytes += manager
                .write_at(&volume, offset, payload.clone(), sync)
                .await
                .with_context(|| format!("write {} at {offset}", volume.name()))?;
        }
        latency.record(u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX));
    }
    Ok(bytes)
}

/// Run the workload against every volume concurrently
pub async fn run(bench: &Bench, config: &Config) -> Result<Report> {
    let workload = Arc::new(config.workload.clone());
    let slots = config.pool.volume_size / workload.io_size;
    let depth = workload.queue_depth as u64;
    let latency = Arc::new(LatencyHistogram::new());

    // Stands in for the store's periodic transaction group sync
    let ticker = {
        let pool = bench.pool.clone();
        let period = Duration::from_millis(config.pool.sync_interval_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                pool.sync();
            }
        })
    };

    let start = Instant::now();
    let mut tasks = JoinSet::new();
    for (vidx, volume) in bench.volumes.iter().enumerate() {
        for q in 0..depth {
            // Spread ops_per_volume over the submitters, remainder to the first ones
            let ops = workload.ops_per_volume / depth
                + u64::from(q < workload.ops_per_volume % depth);
            if ops == 0 {
                continue;
            }
            let seed = workload.seed ^ (((vidx as u64) << 32) | q);
            tasks.spawn(drive(
                Arc::clone(&bench.manager),
                Arc::clone(volume),
                Arc::clone(&workload),
                Arc::clone(&latency),
                slots,
                ops,
                seed,
            ));
        }
    }

    let mut bytes = 0;
    while let Some(joined) = tasks.join_next().await {
        bytes += joined.context("bench task panicked")??;
    }
    let elapsed = start.elapsed();
    ticker.abort();

    let ops = latency.count();
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    let report = Report {
        elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        ops,
        bytes,
        iops: ops as f64 / secs,
        mib_per_sec: bytes as f64 / secs / (1024.0 * 1024.0),
        p50_us: latency.percentile(50.0),
        p90_us: latency.percentile(90.0),
        p99_us: latency.percentile(99.0),
        volumes: bench
            .volumes
            .iter()
            .map(|v| VolumeReport {
                name: v.name(),
                stats: v.stats().snapshot(),
            })
            .collect(),
    };
    debug!(ops, bytes, elapsed_ms = report.elapsed_ms, "workload finished");
    Ok(report)
}
