//! Per-volume I/O statistics
//!
//! Lock-free counters updated on every completed request, plus latency
//! histograms whose buckets double in width.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bucket `i` holds samples below `2^i` microseconds; the last one is
/// open-ended (about 36 minutes and up)
const BUCKETS: usize = 32;

/// Latency histogram over power-of-two microsecond buckets
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; BUCKETS],
    count: AtomicU64,
    total_us: AtomicU64,
    max_us: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

const fn bucket_of(latency_us: u64) -> usize {
    let bits = (u64::BITS - latency_us.leading_zeros()) as usize;
    if bits < BUCKETS { bits } else { BUCKETS - 1 }
}

impl LatencyHistogram {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            total_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
        }
    }

    /// Record one request's latency
    pub fn record(&self, latency_us: u64) {
        self.buckets[bucket_of(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(latency_us, Ordering::Relaxed);
        self.max_us.fetch_max(latency_us, Ordering::Relaxed);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Mean latency in microseconds
    #[must_use]
    pub fn avg(&self) -> u64 {
        self.total_us
            .load(Ordering::Relaxed)
            .checked_div(self.count())
            .unwrap_or(0)
    }

    /// Slowest request in microseconds
    #[must_use]
    pub fn max(&self) -> u64 {
        self.max_us.load(Ordering::Relaxed)
    }

    /// Latency `percentile` percent of requests stayed under: the bound of
    /// the bucket that reaches it, never more than the slowest request
    #[must_use]
    pub fn percentile(&self, percentile: f64) -> u64 {
        let count = self.count();
        if count == 0 {
            return 0;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let target = ((count as f64) * percentile / 100.0).ceil().max(1.0) as u64;
        let max = self.max();
        let mut seen = 0;
        for (idx, bucket) in self.buckets.iter().enumerate().take(BUCKETS - 1) {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= target {
                return (1u64 << idx).min(max);
            }
        }
        max
    }
}

/// Counters of one volume
#[derive(Debug, Default)]
pub struct IoStats {
    read_ops: AtomicU64,
    write_ops: AtomicU64,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
    errors: AtomicU64,
    deferred: AtomicU64,
    range_waits: AtomicU64,
    log_commits: AtomicU64,
    discards: AtomicU64,
    flushes: AtomicU64,
    read_latency: LatencyHistogram,
    write_latency: LatencyHistogram,
}

impl IoStats {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed read
    pub fn record_read(&self, bytes: u64, latency_us: u64) {
        self.read_ops.fetch_add(1, Ordering::Relaxed);
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.read_latency.record(latency_us);
    }

    /// Record a completed write
    pub fn record_write(&self, bytes: u64, latency_us: u64) {
        self.write_ops.fetch_add(1, Ordering::Relaxed);
        self.write_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.write_latency.record(latency_us);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_range_wait(&self) {
        self.range_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_log_commit(&self) {
        self.log_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.discards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Requests that had to wait for admission
    #[must_use]
    pub fn deferred(&self) -> u64 {
        self.deferred.load(Ordering::Relaxed)
    }

    /// Requests that had to wait for a range lock
    #[must_use]
    pub fn range_waits(&self) -> u64 {
        self.range_waits.load(Ordering::Relaxed)
    }

    /// Synchronous log commits requested
    #[must_use]
    pub fn log_commits(&self) -> u64 {
        self.log_commits.load(Ordering::Relaxed)
    }

    /// Read latency histogram
    #[must_use]
    pub const fn read_latency(&self) -> &LatencyHistogram {
        &self.read_latency
    }

    /// Write latency histogram
    #[must_use]
    pub const fn write_latency(&self) -> &LatencyHistogram {
        &self.write_latency
    }

    /// Point-in-time copy of every counter
    #[must_use]
    pub fn snapshot(&self) -> IoStatsSnapshot {
        IoStatsSnapshot {
            read_ops: self.read_ops.load(Ordering::Relaxed),
            write_ops: self.write_ops.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            write_bytes: self.write_bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            deferred: self.deferred(),
            range_waits: self.range_waits(),
            log_commits: self.log_commits(),
            discards: self.discards.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            read_p50_us: self.read_latency.percentile(50.0),
            read_p99_us: self.read_latency.percentile(99.0),
            write_p50_us: self.write_latency.percentile(50.0),
            write_p99_us: self.write_latency.percentile(99.0),
        }
    }
}

/// Serializable copy of [`IoStats`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IoStatsSnapshot {
    pub read_ops: u64,
    pub write_ops: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub errors: u64,
    pub deferred: u64,
    pub range_waits: u64,
    pub log_commits: u64,
    pub discards: u64,
    pub flushes: u64,
    pub read_p50_us: u64,
    pub read_p99_us: u64,
    pub write_p50_us: u64,
    pub write_p99_us: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_percentiles() {
        let h = LatencyHistogram::new();
        for _ in 0..90 {
            h.record(15);
        }
        for _ in 0..10 {
            h.record(3_000);
        }
        assert_eq!(h.count(), 100);
        assert_eq!(h.percentile(50.0), 16);
        assert_eq!(h.percentile(90.0), 16);
        // Clamped to the slowest request rather than the 4096us bound
        assert_eq!(h.percentile(99.0), 3_000);
        assert_eq!(h.max(), 3_000);
    }

    #[test]
    fn test_bucket_edges() {
        assert_eq!(bucket_of(0), 0);
        assert_eq!(bucket_of(1), 1);
        assert_eq!(bucket_of(1023), 10);
        assert_eq!(bucket_of(1024), 11);
        assert_eq!(bucket_of(u64::MAX), BUCKETS - 1);
    }

    #[test]
    fn test_empty_histogram() {
        let h = LatencyHistogram::new();
        assert_eq!(h.avg(), 0);
        assert_eq!(h.percentile(99.0), 0);
    }

    #[test]
    fn test_snapshot_counts() {
        let stats = IoStats::new();
        stats.record_read(4096, 30);
        stats.record_write(8192, 40);
        stats.record_write(8192, 60);
        stats.record_deferred();
        let snap = stats.snapshot();
        assert_eq!(snap.read_ops, 1);
        assert_eq!(snap.write_ops, 2);
        assert_eq!(snap.write_bytes, 16384);
        assert_eq!(snap.deferred, 1);
        assert_eq!(stats.write_latency().avg(), 50);
    }
}
