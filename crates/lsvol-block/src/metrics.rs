//! Per-volume performance counters
//!
//! Every request phase is timed into its own [`LatencyHistogram`]:
//! allocation, cache/device write, mapping update and mapping lookup,
//! plus end-to-end read and write latency. Snapshots are cheap and
//! lock-free; [`VolumeMetrics::log_summary`] reports through `tracing`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

const BUCKETS: usize = 24;

/// Power-of-two latency histogram
///
/// Bucket `i` counts samples below `2^i` microseconds; the last bucket
/// is unbounded (about 4s and up).
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; BUCKETS],
    count: AtomicU64,
    sum_us: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency percentiles in microseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyPercentiles {
    pub count: u64,
    pub avg: u64,
    pub min: u64,
    pub max: u64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
}

impl LatencyHistogram {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
        }
    }

    const fn bucket_of(us: u64) -> usize {
        let idx = (u64::BITS - us.leading_zeros()) as usize;
        if idx >= BUCKETS { BUCKETS - 1 } else { idx }
    }

    /// Upper bound of bucket `idx` in microseconds
    const fn upper_bound(idx: usize) -> u64 {
        if idx + 1 >= BUCKETS { u64::MAX } else { 1 << idx }
    }

    pub fn record(&self, latency: Duration) {
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.buckets[Self::bucket_of(us)].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.min_us.fetch_min(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Mean latency in microseconds
    #[must_use]
    pub fn avg(&self) -> u64 {
        self.sum_us
            .load(Ordering::Relaxed)
            .checked_div(self.count())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn min(&self) -> u64 {
        match self.min_us.load(Ordering::Relaxed) {
            u64::MAX => 0,
            min => min,
        }
    }

    #[must_use]
    pub fn max(&self) -> u64 {
        self.max_us.load(Ordering::Relaxed)
    }

    /// Bucket upper bound at or below which `quantile` of samples fall,
    /// clamped to the observed maximum
    #[must_use]
    pub fn percentile(&self, quantile: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let target = ((total as f64) * quantile.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (idx, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= target {
                return Self::upper_bound(idx).min(self.max());
            }
        }
        self.max()
    }

    #[must_use]
    pub fn percentiles(&self) -> LatencyPercentiles {
        LatencyPercentiles {
            count: self.count(),
            avg: self.avg(),
            min: self.min(),
            max: self.max(),
            p50: self.percentile(0.50),
            p90: self.percentile(0.90),
            p99: self.percentile(0.99),
        }
    }
}

/// Timing and count accumulators for one volume
#[derive(Debug, Default)]
pub struct VolumeMetrics {
    /// Allocator time per write
    pub alloc: LatencyHistogram,
    /// Cache or device write time per write
    pub io_write: LatencyHistogram,
    /// Block store read time per sub-read
    pub io_read: LatencyHistogram,
    /// Mapping upsert time
    pub map_update: LatencyHistogram,
    /// Mapping lookup time
    pub map_read: LatencyHistogram,
    /// End-to-end write latency
    pub write: LatencyHistogram,
    /// End-to-end read latency
    pub read: LatencyHistogram,
    pub writes: AtomicU64,
    pub reads: AtomicU64,
    pub unmaps: AtomicU64,
    pub write_bytes: AtomicU64,
    pub read_bytes: AtomicU64,
    pub failed: AtomicU64,
}

/// Point-in-time copy of [`VolumeMetrics`]
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub writes: u64,
    pub reads: u64,
    pub unmaps: u64,
    pub write_bytes: u64,
    pub read_bytes: u64,
    pub failed: u64,
    pub alloc: LatencyPercentiles,
    pub io_write: LatencyPercentiles,
    pub io_read: LatencyPercentiles,
    pub map_update: LatencyPercentiles,
    pub map_read: LatencyPercentiles,
    pub write: LatencyPercentiles,
    pub read: LatencyPercentiles,
}

impl VolumeMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_write(&self, bytes: usize, latency: Duration) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.write_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.write.record(latency);
    }

    pub fn record_read(&self, bytes: usize, latency: Duration) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.read_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.read.record(latency);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            writes: self.writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            unmaps: self.unmaps.load(Ordering::Relaxed),
            write_bytes: self.write_bytes.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            alloc: self.alloc.percentiles(),
            io_write: self.io_write.percentiles(),
            io_read: self.io_read.percentiles(),
            map_update: self.map_update.percentiles(),
            map_read: self.map_read.percentiles(),
            write: self.write.percentiles(),
            read: self.read.percentiles(),
        }
    }

    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            "volume I/O: {} writes ({} bytes), {} reads ({} bytes), {} unmaps, {} failed",
            s.writes, s.write_bytes, s.reads, s.read_bytes, s.unmaps, s.failed
        );
        for (name, p) in [
            ("write", s.write),
            ("read", s.read),
            ("alloc", s.alloc),
            ("io_write", s.io_write),
            ("io_read", s.io_read),
            ("map_update", s.map_update),
            ("map_read", s.map_read),
        ] {
            if p.count > 0 {
                info!(
                    "{:>10}: n={} avg={}us min={}us p50={}us p90={}us p99={}us max={}us",
                    name, p.count, p.avg, p.min, p.p50, p.p90, p.p99, p.max
                );
            }
        }
    }
}
