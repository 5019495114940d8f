//! Store Metrics Collection
//!
//! Per-store counters and latency averages, readable as a [`MetricsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Store metrics collector
#[derive(Debug, Default)]
pub struct StoreMetrics {
    // Reads
    hits: AtomicU64,
    misses: AtomicU64,
    bytes_read: AtomicU64,
    hash_mismatches: AtomicU64,

    // Writes
    writes: AtomicU64,
    write_failures: AtomicU64,
    bytes_written: AtomicU64,

    // Tier movement
    upstream_queued: AtomicU64,
    upstream_completed: AtomicU64,
    upstream_failed: AtomicU64,
    write_backs: AtomicU64,

    // Capacity
    evictions: AtomicU64,

    // Operation latencies (microseconds, using exponential moving average)
    read_latency_us: AtomicU64,
    write_latency_us: AtomicU64,
}

impl StoreMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    // Reads
    pub fn record_hit(&self, bytes: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hash_mismatch(&self) {
        self.hash_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    // Writes
    pub fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    // Tier movement
    pub fn record_upstream_queued(&self) {
        self.upstream_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_completed(&self) {
        self.upstream_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_failed(&self) {
        self.upstream_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_back(&self) {
        self.write_backs.fetch_add(1, Ordering::Relaxed);
    }

    // Capacity
    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    // Latency tracking
    pub fn record_read_latency(&self, duration: Duration) {
        self.update_latency_ema(&self.read_latency_us, duration);
    }

    pub fn record_write_latency(&self, duration: Duration) {
        self.update_latency_ema(&self.write_latency_us, duration);
    }

    fn update_latency_ema(&self, target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn read_latency(&self) -> Duration {
        Duration::from_micros(self.read_latency_us.load(Ordering::Relaxed))
    }

    pub fn write_latency(&self) -> Duration {
        Duration::from_micros(self.write_latency_us.load(Ordering::Relaxed))
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            hash_mismatches: self.hash_mismatches.load(Ordering::Relaxed),

            writes: self.writes(),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),

            upstream_queued: self.upstream_queued.load(Ordering::Relaxed),
            upstream_completed: self.upstream_completed.load(Ordering::Relaxed),
            upstream_failed: self.upstream_failed.load(Ordering::Relaxed),
            write_backs: self.write_backs.load(Ordering::Relaxed),

            evictions: self.evictions.load(Ordering::Relaxed),

            read_latency: self.read_latency(),
            write_latency: self.write_latency(),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.bytes_read,
            &self.hash_mismatches,
            &self.writes,
            &self.write_failures,
            &self.bytes_written,
            &self.upstream_queued,
            &self.upstream_completed,
            &self.upstream_failed,
            &self.write_backs,
            &self.evictions,
            &self.read_latency_us,
            &self.write_latency_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of all store metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    // Reads
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub bytes_read: u64,
    pub hash_mismatches: u64,

    // Writes
    pub writes: u64,
    pub write_failures: u64,
    pub bytes_written: u64,

    // Tier movement
    pub upstream_queued: u64,
    pub upstream_completed: u64,
    pub upstream_failed: u64,
    pub write_backs: u64,

    // Capacity
    pub evictions: u64,

    // Latency
    pub read_latency: Duration,
    pub write_latency: Duration,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_tracking() {
        let metrics = StoreMetrics::new();

        metrics.record_hit(10);
        metrics.record_hit(20);
        metrics.record_miss();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.bytes_read, 30);
        assert!((snapshot.hit_ratio - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_latency_tracking() {
        let metrics = StoreMetrics::new();

        metrics.record_read_latency(Duration::from_micros(100));
        assert_eq!(metrics.read_latency(), Duration::from_micros(100));

        // EMA should smooth values
        metrics.record_read_latency(Duration::from_micros(200));
        let latency = metrics.read_latency().as_micros();
        assert!(latency > 100 && latency < 200);
    }

    #[test]
    fn test_upstream_counters_and_reset() {
        let metrics = StoreMetrics::new();
        metrics.record_upstream_queued();
        metrics.record_upstream_queued();
        metrics.record_upstream_completed();
        metrics.record_upstream_failed();
        metrics.record_write_back();
        metrics.record_write(5);
        metrics.record_write_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.upstream_queued, 2);
        assert_eq!(snapshot.upstream_completed, 1);
        assert_eq!(snapshot.upstream_failed, 1);
        assert_eq!(snapshot.write_backs, 1);
        assert_eq!((snapshot.writes, snapshot.write_failures), (1, 1));

        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.writes, 0);
        assert_eq!(snapshot.upstream_queued, 0);
        assert_eq!(metrics.hit_ratio(), 0.0);
    }
}
