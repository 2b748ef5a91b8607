// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process read cache in front of the local store.
//!
//! Entries carry a TTL and are expired lazily on `get`; a periodic sweep
//! removes expired entries proactively. When the entry count or the
//! estimated memory footprint exceeds the configured budget, entries are
//! evicted in insertion order (FIFO, not LRU).
//!
//! # Example
//!
//! ```
//! use dualsync::{MemoryCache, CacheConfig, Record};
//! use serde_json::json;
//!
//! let cache = MemoryCache::new(CacheConfig::default());
//! cache.insert(Record::new("users".into(), "u-1".into(), json!({"name": "Ada"})));
//!
//! let hit = cache.get("users", "u-1");
//! assert!(hit.is_some());
//!
//! let info = cache.info();
//! assert_eq!(info.entries, 1);
//! assert!(info.hit_rate > 0.0);
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::record::{now_millis, Record};

/// Runtime-adjustable cache limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Memory budget for cached records, in bytes
    pub max_memory_bytes: usize,
    /// Entry count budget
    pub max_entries: usize,
    /// Time-to-live for each entry, in seconds
    pub ttl_secs: u64,
    /// Interval between proactive expired-entry sweeps, in seconds
    pub gc_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 64 * 1024 * 1024,
            max_entries: 10_000,
            ttl_secs: 300,
            gc_interval_secs: 60,
        }
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheInfo {
    /// Live entry count
    pub entries: usize,
    /// Same as `entries` (kept for callers that report "size")
    pub size: usize,
    /// Estimated memory footprint in bytes
    pub memory_bytes: usize,
    /// hits / (hits + misses) since the last reset
    pub hit_rate: f64,
}

struct CacheEntry {
    record: Record,
    expires_at_ms: i64,
    size_bytes: usize,
    /// Monotone insertion sequence, used for FIFO eviction
    seq: u64,
}

/// TTL- and size-bounded cache keyed by `(table, id)`.
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    config: RwLock<CacheConfig>,
    mem_bytes: AtomicUsize,
    seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

fn cache_key(table: &str, id: &str) -> String {
    format!("{}/{}", table, id)
}

impl MemoryCache {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config: RwLock::new(config),
            mem_bytes: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a record, lazily expiring it if its TTL has elapsed.
    pub fn get(&self, table: &str, id: &str) -> Option<Record> {
        let key = cache_key(table, id);
        let now = now_millis();

        let expired = match self.entries.get(&key) {
            Some(entry) if now <= entry.expires_at_ms => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_lookup(true);
                return Some(entry.record.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.remove_key(&key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_lookup(false);
        None
    }

    /// Insert (or replace) a record, evicting oldest entries if the
    /// configured budgets are exceeded.
    pub fn insert(&self, record: Record) {
        let key = cache_key(&record.table, &record.id);
        let now = now_millis();
        let ttl_ms = self.config.read().ttl_secs as i64 * 1000;
        let size = record.size_bytes() + key.len();

        let entry = CacheEntry {
            record,
            expires_at_ms: now + ttl_ms,
            size_bytes: size,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };

        if let Some(old) = self.entries.insert(key, entry) {
            let current = self.mem_bytes.load(Ordering::Acquire);
            let new_total = current.saturating_sub(old.size_bytes).saturating_add(size);
            self.mem_bytes.store(new_total, Ordering::Release);
        } else {
            self.mem_bytes.fetch_add(size, Ordering::Release);
        }

        self.evict_over_budget();
    }

    /// Drop a single record (e.g. after a delete).
    pub fn invalidate(&self, table: &str, id: &str) {
        self.remove_key(&cache_key(table, id));
    }

    /// Proactively remove all expired entries. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = now_millis();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| now > e.expires_at_ms)
            .map(|e| e.key().clone())
            .collect();

        for key in &expired {
            self.remove_key(key);
        }

        if !expired.is_empty() {
            debug!(removed = expired.len(), "Cache GC sweep removed expired entries");
        }
        crate::metrics::set_cache_entries(self.entries.len());
        crate::metrics::set_cache_bytes(self.mem_bytes.load(Ordering::Acquire));
        expired.len()
    }

    /// Drop all entries and reset hit/miss counters.
    pub fn clear(&self) {
        self.entries.clear();
        self.mem_bytes.store(0, Ordering::Release);
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    #[must_use]
    pub fn info(&self) -> CacheInfo {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let entries = self.entries.len();
        CacheInfo {
            entries,
            size: entries,
            memory_bytes: self.mem_bytes.load(Ordering::Acquire),
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
        }
    }

    #[must_use]
    pub fn config(&self) -> CacheConfig {
        self.config.read().clone()
    }

    /// Replace the cache limits. Tighter budgets take effect immediately.
    pub fn set_config(&self, config: CacheConfig) {
        *self.config.write() = config;
        self.evict_over_budget();
    }

    /// Memory usage as a fraction of the configured budget.
    #[must_use]
    pub fn memory_pressure(&self) -> f64 {
        let max = self.config.read().max_memory_bytes;
        if max == 0 {
            0.0
        } else {
            self.mem_bytes.load(Ordering::Acquire) as f64 / max as f64
        }
    }

    /// GC sweep interval from the current config.
    #[must_use]
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.config.read().gc_interval_secs.max(1))
    }

    fn remove_key(&self, key: &str) {
        if let Some((_, old)) = self.entries.remove(key) {
            let _ = self
                .mem_bytes
                .fetch_update(Ordering::Release, Ordering::Acquire, |cur| {
                    Some(cur.saturating_sub(old.size_bytes))
                });
        }
    }

    /// FIFO eviction: drop lowest-sequence entries until both budgets hold.
    fn evict_over_budget(&self) {
        let (max_entries, max_bytes) = {
            let cfg = self.config.read();
            (cfg.max_entries, cfg.max_memory_bytes)
        };

        let over_entries = self.entries.len() > max_entries;
        let over_bytes = self.mem_bytes.load(Ordering::Acquire) > max_bytes;
        if !over_entries && !over_bytes {
            return;
        }

        let mut by_age: Vec<(u64, String)> = self
            .entries
            .iter()
            .map(|e| (e.seq, e.key().clone()))
            .collect();
        by_age.sort_unstable_by_key(|(seq, _)| *seq);

        let mut evicted = 0usize;
        for (_, key) in by_age {
            if self.entries.len() <= max_entries
                && self.mem_bytes.load(Ordering::Acquire) <= max_bytes
            {
                break;
            }
            self.remove_key(&key);
            evicted += 1;
        }

        if evicted > 0 {
            debug!(evicted, "Cache eviction (insertion order)");
            crate::metrics::record_cache_eviction(evicted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(table: &str, id: &str) -> Record {
        Record::new(table.to_string(), id.to_string(), json!({"id": id}))
    }

    fn small_config() -> CacheConfig {
        CacheConfig {
            max_memory_bytes: 1024 * 1024,
            max_entries: 3,
            ttl_secs: 300,
            gc_interval_secs: 60,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let cache = MemoryCache::new(CacheConfig::default());
        cache.insert(record("users", "u-1"));

        let hit = cache.get("users", "u-1").unwrap();
        assert_eq!(hit.id, "u-1");
    }

    #[test]
    fn test_miss_returns_none() {
        let cache = MemoryCache::new(CacheConfig::default());
        assert!(cache.get("users", "missing").is_none());
    }

    #[test]
    fn test_hit_rate_accumulates() {
        let cache = MemoryCache::new(CacheConfig::default());
        cache.insert(record("users", "u-1"));

        cache.get("users", "u-1"); // hit
        cache.get("users", "u-2"); // miss

        let info = cache.info();
        assert!((info.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ttl_expiry_is_lazy() {
        let config = CacheConfig { ttl_secs: 0, ..CacheConfig::default() };
        let cache = MemoryCache::new(config);
        cache.insert(record("users", "u-1"));

        // ttl_secs = 0 expires on the next millisecond tick
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("users", "u-1").is_none());
        assert_eq!(cache.info().entries, 0, "lazy expiry removes the entry");
    }

    #[test]
    fn test_fifo_eviction_on_entry_budget() {
        let cache = MemoryCache::new(small_config());

        cache.insert(record("t", "a"));
        cache.insert(record("t", "b"));
        cache.insert(record("t", "c"));
        cache.insert(record("t", "d")); // evicts "a" (oldest insertion)

        assert_eq!(cache.info().entries, 3);
        assert!(cache.get("t", "a").is_none());
        assert!(cache.get("t", "d").is_some());
    }

    #[test]
    fn test_memory_budget_eviction() {
        let config = CacheConfig {
            max_memory_bytes: 600,
            max_entries: 1_000,
            ttl_secs: 300,
            gc_interval_secs: 60,
        };
        let cache = MemoryCache::new(config);

        for i in 0..20 {
            cache.insert(record("t", &format!("id-{}", i)));
        }

        assert!(cache.info().memory_bytes <= 600);
        assert!(cache.info().entries < 20);
    }

    #[test]
    fn test_replace_updates_memory_tracking() {
        let cache = MemoryCache::new(CacheConfig::default());
        cache.insert(record("t", "a"));
        let before = cache.info().memory_bytes;

        let bigger = Record::new(
            "t".into(),
            "a".into(),
            json!({"payload": "x".repeat(500)}),
        );
        cache.insert(bigger);

        let info = cache.info();
        assert_eq!(info.entries, 1);
        assert!(info.memory_bytes > before);
    }

    #[test]
    fn test_sweep_expired() {
        let config = CacheConfig { ttl_secs: 0, ..CacheConfig::default() };
        let cache = MemoryCache::new(config);

        for i in 0..5 {
            cache.insert(record("t", &format!("id-{}", i)));
        }
        std::thread::sleep(Duration::from_millis(5));

        let removed = cache.sweep_expired();
        assert_eq!(removed, 5);
        assert_eq!(cache.info().entries, 0);
    }

    #[test]
    fn test_clear_resets_counters() {
        let cache = MemoryCache::new(CacheConfig::default());
        cache.insert(record("t", "a"));
        cache.get("t", "a");
        cache.get("t", "missing");

        cache.clear();

        let info = cache.info();
        assert_eq!(info.entries, 0);
        assert_eq!(info.memory_bytes, 0);
        assert_eq!(info.hit_rate, 0.0);
    }

    #[test]
    fn test_config_round_trip() {
        let cache = MemoryCache::new(CacheConfig::default());
        let cfg = CacheConfig {
            max_memory_bytes: 123_456,
            max_entries: 77,
            ttl_secs: 11,
            gc_interval_secs: 5,
        };
        cache.set_config(cfg.clone());
        assert_eq!(cache.config(), cfg);
    }

    #[test]
    fn test_set_config_applies_tighter_budget_immediately() {
        let cache = MemoryCache::new(CacheConfig::default());
        for i in 0..10 {
            cache.insert(record("t", &format!("id-{}", i)));
        }

        cache.set_config(CacheConfig { max_entries: 4, ..CacheConfig::default() });

        assert!(cache.info().entries <= 4);
    }

    #[test]
    fn test_invalidate() {
        let cache = MemoryCache::new(CacheConfig::default());
        cache.insert(record("t", "a"));

        cache.invalidate("t", "a");

        assert!(cache.get("t", "a").is_none());
    }

    #[test]
    fn test_memory_pressure() {
        let config = CacheConfig { max_memory_bytes: 10_000, ..CacheConfig::default() };
        let cache = MemoryCache::new(config);
        assert_eq!(cache.memory_pressure(), 0.0);

        cache.insert(record("t", "a"));
        assert!(cache.memory_pressure() > 0.0);
    }

    #[test]
    fn test_cache_info_scenario() {
        let cache = MemoryCache::new(CacheConfig::default());
        cache.insert(record("t", "k"));

        let info = cache.info();
        assert_eq!(info.entries, 1);
        assert_eq!(info.size, 1);
        assert!(info.memory_bytes > 0);
        assert!(info.hit_rate >= 0.0);
    }
}
