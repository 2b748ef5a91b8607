// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Conflict detection journal and last-write-wins resolution.
//!
//! A conflict is two writes to the same record arriving through the two
//! stores with different field payloads. Resolution compares the writes'
//! wall-clock timestamps: the newer write wins, and the loser is recorded
//! here. A conflict is never left pending.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::record::now_millis;

/// Winner of a resolved conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Resolution {
    LocalWins,
    RemoteWins,
}

/// One resolved conflict, kept for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictRecord {
    pub table: String,
    pub record_id: String,
    pub local: Value,
    pub remote: Value,
    pub local_ts: i64,
    pub remote_ts: i64,
    pub detected_at_ms: i64,
    pub resolution: Resolution,
}

/// Decide a conflict by wall-clock timestamp. The local write wins only
/// if it is strictly newer; ties go to the remote (it is authoritative).
#[must_use]
pub fn resolve(local_ts: i64, remote_ts: i64) -> Resolution {
    if local_ts > remote_ts {
        Resolution::LocalWins
    } else {
        Resolution::RemoteWins
    }
}

/// Bounded in-memory journal of resolved conflicts, oldest first.
pub struct ConflictLog {
    entries: Mutex<VecDeque<ConflictRecord>>,
    cap: usize,
}

impl ConflictLog {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(cap.min(64))),
            cap: cap.max(1),
        }
    }

    /// Record a resolved conflict. Timestamps come from the conflicting
    /// writes themselves, not from detection time.
    pub fn record(
        &self,
        table: &str,
        record_id: &str,
        local: Value,
        remote: Value,
        local_ts: i64,
        remote_ts: i64,
    ) -> Resolution {
        let resolution = resolve(local_ts, remote_ts);
        info!(
            table,
            record_id,
            local_ts,
            remote_ts,
            ?resolution,
            "Conflict resolved"
        );
        crate::metrics::record_conflict();

        let entry = ConflictRecord {
            table: table.to_string(),
            record_id: record_id.to_string(),
            local,
            remote,
            local_ts,
            remote_ts,
            detected_at_ms: now_millis(),
            resolution,
        };

        let mut entries = self.entries.lock();
        if entries.len() >= self.cap {
            entries.pop_front();
        }
        entries.push_back(entry);
        resolution
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Snapshot of the journal, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConflictRecord> {
        self.entries.lock().iter().cloned().collect()
    }
}

impl Default for ConflictLog {
    fn default() -> Self {
        Self::new(512)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_newer_local_wins() {
        assert_eq!(resolve(200, 100), Resolution::LocalWins);
    }

    #[test]
    fn test_newer_remote_wins() {
        assert_eq!(resolve(100, 200), Resolution::RemoteWins);
    }

    #[test]
    fn test_tie_goes_to_remote() {
        assert_eq!(resolve(150, 150), Resolution::RemoteWins);
    }

    #[test]
    fn test_record_stores_entry() {
        let log = ConflictLog::default();
        let resolution = log.record(
            "users",
            "u-1",
            json!({"name": "local"}),
            json!({"name": "remote"}),
            200,
            100,
        );

        assert_eq!(resolution, Resolution::LocalWins);
        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].table, "users");
        assert_eq!(snapshot[0].resolution, Resolution::LocalWins);
        assert!(snapshot[0].detected_at_ms > 0);
    }

    #[test]
    fn test_log_is_bounded() {
        let log = ConflictLog::new(3);
        for i in 0..5 {
            log.record("t", &format!("id-{}", i), json!({}), json!({}), i, 0);
        }

        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), 3);
        // Oldest entries were dropped
        assert_eq!(snapshot[0].record_id, "id-2");
        assert_eq!(snapshot[2].record_id, "id-4");
    }

    #[test]
    fn test_empty_log() {
        let log = ConflictLog::default();
        assert!(log.is_empty());
        assert_eq!(log.len(), 0);
        assert!(log.snapshot().is_empty());
    }
}
