// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic resource sampling: process memory/CPU, cache footprint,
//! queue depth, and backend connectivity. History is bounded; the
//! optimizer consumes the latest sample.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;

use crate::cache::CacheInfo;
use crate::record::now_millis;
use crate::resilience::ConnectionStatus;

/// One snapshot of process and engine resource usage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSample {
    pub timestamp_ms: i64,
    /// Resident memory of this process, in bytes
    pub memory_used_bytes: u64,
    /// Process CPU usage since the previous sample, percent
    pub cpu_percent: f32,
    pub cache_bytes: usize,
    pub cache_entries: usize,
    pub queue_depth: usize,
    pub local_healthy: bool,
    pub remote_healthy: bool,
}

/// Bounded sampler over process and engine state.
pub struct ResourceMonitor {
    sys: Mutex<sysinfo::System>,
    history: Mutex<VecDeque<ResourceSample>>,
    history_cap: usize,
}

impl ResourceMonitor {
    #[must_use]
    pub fn new(history_cap: usize) -> Self {
        Self {
            sys: Mutex::new(sysinfo::System::new()),
            history: Mutex::new(VecDeque::with_capacity(history_cap.min(64))),
            history_cap: history_cap.max(1),
        }
    }

    /// Take one sample and append it to the history.
    pub fn collect(
        &self,
        cache: &CacheInfo,
        queue_depth: usize,
        status: ConnectionStatus,
    ) -> ResourceSample {
        let (memory_used_bytes, cpu_percent) = {
            let mut sys = self.sys.lock();
            match sysinfo::get_current_pid() {
                Ok(pid) => {
                    sys.refresh_process(pid);
                    sys.process(pid)
                        .map(|proc| (proc.memory(), proc.cpu_usage()))
                        .unwrap_or((0, 0.0))
                }
                Err(_) => (0, 0.0),
            }
        };

        let sample = ResourceSample {
            timestamp_ms: now_millis(),
            memory_used_bytes,
            cpu_percent,
            cache_bytes: cache.memory_bytes,
            cache_entries: cache.entries,
            queue_depth,
            local_healthy: status.local,
            remote_healthy: status.remote,
        };

        let mut history = self.history.lock();
        if history.len() >= self.history_cap {
            history.pop_front();
        }
        history.push_back(sample.clone());
        sample
    }

    /// Full sample history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<ResourceSample> {
        self.history.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn latest(&self) -> Option<ResourceSample> {
        self.history.lock().back().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_info(bytes: usize, entries: usize) -> CacheInfo {
        CacheInfo {
            entries,
            size: entries,
            memory_bytes: bytes,
            hit_rate: 0.0,
        }
    }

    fn connected() -> ConnectionStatus {
        ConnectionStatus {
            local: true,
            remote: true,
        }
    }

    #[test]
    fn test_collect_appends_sample() {
        let monitor = ResourceMonitor::new(10);
        let sample = monitor.collect(&cache_info(1234, 5), 7, connected());

        assert_eq!(sample.cache_bytes, 1234);
        assert_eq!(sample.cache_entries, 5);
        assert_eq!(sample.queue_depth, 7);
        assert!(sample.local_healthy);
        assert!(sample.timestamp_ms > 0);
        assert_eq!(monitor.history().len(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let monitor = ResourceMonitor::new(3);
        for i in 0..5 {
            monitor.collect(&cache_info(i, i), i, connected());
        }

        let history = monitor.history();
        assert_eq!(history.len(), 3);
        // Oldest samples were dropped
        assert_eq!(history[0].queue_depth, 2);
        assert_eq!(history[2].queue_depth, 4);
    }

    #[test]
    fn test_latest_tracks_last_sample() {
        let monitor = ResourceMonitor::new(10);
        assert!(monitor.latest().is_none());

        monitor.collect(&cache_info(0, 0), 1, connected());
        monitor.collect(&cache_info(0, 0), 2, connected());

        assert_eq!(monitor.latest().unwrap().queue_depth, 2);
    }

    #[test]
    fn test_sample_serializes() {
        let monitor = ResourceMonitor::new(10);
        let sample = monitor.collect(&cache_info(10, 1), 0, connected());
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["cache_bytes"], 10);
    }
}
