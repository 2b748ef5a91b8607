//! Feedback loop that adapts cache limits and the pull cadence to
//! observed pressure.
//!
//! Two independent knobs:
//! - **Memory pressure** shrinks the cache budgets (and speeds up GC)
//!   through [`PressureLevel`]; pressure returning to normal restores
//!   the configured baseline.
//! - **Queue pressure** stretches the pull interval so a backlogged
//!   push path is not competing with pull traffic; it snaps back to the
//!   baseline once the queue drains.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::backpressure::PressureLevel;
use crate::cache::{CacheConfig, MemoryCache};
use crate::config::DualSyncConfig;
use crate::monitor::ResourceSample;

pub struct AutoOptimizer {
    baseline: CacheConfig,
    baseline_pull_interval_ms: u64,
    /// Shared with the pull loop, which reads it every tick
    pull_interval_ms: Arc<AtomicU64>,
}

impl AutoOptimizer {
    #[must_use]
    pub fn new(baseline: CacheConfig, pull_interval_ms: Arc<AtomicU64>) -> Self {
        let baseline_pull_interval_ms = pull_interval_ms.load(Ordering::Acquire);
        Self {
            baseline,
            baseline_pull_interval_ms,
            pull_interval_ms,
        }
    }

    /// Apply one optimization pass based on the latest sample.
    pub fn optimize(&self, sample: &ResourceSample, cache: &MemoryCache, cfg: &DualSyncConfig) {
        self.adjust_cache(sample, cache, cfg);
        self.adjust_pull_interval(sample, cfg);
    }

    fn adjust_cache(&self, sample: &ResourceSample, cache: &MemoryCache, cfg: &DualSyncConfig) {
        let pressure = if self.baseline.max_memory_bytes == 0 {
            0.0
        } else {
            sample.cache_bytes as f64 / self.baseline.max_memory_bytes as f64
        };
        crate::metrics::set_memory_pressure(pressure);

        let level = PressureLevel::from_pressure(
            pressure,
            cfg.memory_warn_pressure,
            cfg.memory_critical_pressure,
        );

        let target = match level {
            PressureLevel::Normal => self.baseline.clone(),
            _ => {
                let factor = level.cache_shrink_factor();
                CacheConfig {
                    max_memory_bytes: (self.baseline.max_memory_bytes as f64 * factor) as usize,
                    max_entries: ((self.baseline.max_entries as f64 * factor) as usize).max(1),
                    ttl_secs: self.baseline.ttl_secs,
                    gc_interval_secs: (self.baseline.gc_interval_secs / level.gc_speedup()).max(1),
                }
            }
        };

        if cache.config() != target {
            info!(
                level = %level,
                max_memory_bytes = target.max_memory_bytes,
                max_entries = target.max_entries,
                "Adjusting cache limits"
            );
            cache.set_config(target);
        }
    }

    fn adjust_pull_interval(&self, sample: &ResourceSample, cfg: &DualSyncConfig) {
        let current = self.pull_interval_ms.load(Ordering::Acquire);
        let next = if sample.queue_depth >= cfg.queue_depth_warn {
            (current.saturating_mul(2)).min(cfg.pull_interval_max_ms)
        } else {
            self.baseline_pull_interval_ms
        };

        if next != current {
            info!(
                queue_depth = sample.queue_depth,
                from_ms = current,
                to_ms = next,
                "Adjusting pull interval"
            );
            self.pull_interval_ms.store(next, Ordering::Release);
        }
    }
}
