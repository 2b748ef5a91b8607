// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for dualsync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding application is responsible for choosing the exporter
//! (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `dualsync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `store`: local, remote
//! - `operation`: fetch, upsert, delete, push, pull
//! - `status`: success, error

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a store operation outcome
pub fn record_operation(store: &str, operation: &str, status: &str) {
    counter!(
        "dualsync_operations_total",
        "store" => store.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(store: &str, operation: &str, duration: Duration) {
    histogram!(
        "dualsync_operation_seconds",
        "store" => store.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a cache hit or miss
pub fn record_cache_lookup(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!(
        "dualsync_cache_lookups_total",
        "outcome" => outcome
    )
    .increment(1);
}

/// Record cache eviction event
pub fn record_cache_eviction(count: usize) {
    counter!("dualsync_cache_evictions_total").increment(count as u64);
}

/// Set current cache size in bytes
pub fn set_cache_bytes(bytes: usize) {
    gauge!("dualsync_cache_bytes").set(bytes as f64);
}

/// Set current cache entry count
pub fn set_cache_entries(count: usize) {
    gauge!("dualsync_cache_entries").set(count as f64);
}

/// Set memory pressure level (0.0 - 1.0)
pub fn set_memory_pressure(pressure: f64) {
    gauge!("dualsync_memory_pressure").set(pressure);
}

/// Set pending sync-queue depth
pub fn set_queue_depth(count: usize) {
    gauge!("dualsync_queue_depth").set(count as f64);
}

/// Set dead-letter buffer depth
pub fn set_dead_letter_depth(count: usize) {
    gauge!("dualsync_dead_letter_depth").set(count as f64);
}

/// Record a resolved conflict
pub fn record_conflict() {
    counter!("dualsync_conflicts_total").increment(1);
}

/// Record rows replicated by one pull pass
pub fn record_pull_rows(table: &str, count: usize) {
    counter!(
        "dualsync_pull_rows_total",
        "table" => table.to_string()
    )
    .increment(count as u64);
}

/// Set backend health status (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "dualsync_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Record a connection/backend error
pub fn record_connection_error(backend: &str) {
    counter!(
        "dualsync_connection_errors_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

/// Set service state (for monitoring state machine transitions)
pub fn set_service_state(state: &str) {
    counter!(
        "dualsync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    store: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(store: &'static str, operation: &'static str) -> Self {
        Self {
            store,
            operation,
            start: Instant::now(),
        }
    }

    /// Elapsed time since the timer started
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.store, self.operation, self.start.elapsed());
    }
}
