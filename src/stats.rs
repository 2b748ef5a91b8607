//! Lightweight sync counters exposed through the service facade.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Snapshot of sync activity since the service was created.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStats {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub conflicts_resolved: u64,
    pub dead_lettered: u64,
    /// Rolling average time to push one operation, in milliseconds
    pub avg_sync_time_ms: f64,
}

#[derive(Default)]
struct SyncTiming {
    total_ms: f64,
    samples: u64,
}

/// Thread-safe accumulator behind [`SyncStats`].
#[derive(Default)]
pub struct StatsCollector {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    conflicts: AtomicU64,
    dead_lettered: AtomicU64,
    timing: Mutex<SyncTiming>,
}

impl StatsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, elapsed_ms: f64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.successful.fetch_add(1, Ordering::Relaxed);
        let mut timing = self.timing.lock();
        timing.total_ms += elapsed_ms;
        timing.samples += 1;
    }

    pub fn record_failure(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> SyncStats {
        let timing = self.timing.lock();
        let avg = if timing.samples == 0 {
            0.0
        } else {
            timing.total_ms / timing.samples as f64
        };
        SyncStats {
            total_operations: self.total.load(Ordering::Relaxed),
            successful_operations: self.successful.load(Ordering::Relaxed),
            failed_operations: self.failed.load(Ordering::Relaxed),
            conflicts_resolved: self.conflicts.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            avg_sync_time_ms: avg,
        }
    }
}
