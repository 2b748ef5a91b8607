//! Pending-operation queue between local writes and the remote push loop.
//!
//! Three strict priority bands (High > Normal > Low), FIFO within each
//! band. Operations that exhaust their retry budget move to a bounded
//! dead-letter buffer instead of being silently dropped.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::record::now_millis;

/// Oldest dead-lettered operations are discarded past this many.
const DEAD_LETTER_CAP: usize = 256;

/// The kind of change a queued operation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// Scheduling band for a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    High,
    Normal,
    Low,
}

/// A single pending change destined for the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: Uuid,
    pub op: Operation,
    pub table: String,
    pub record_id: String,
    /// Full field payload (`Null` for deletes)
    pub fields: Value,
    /// Wall-clock time of the originating local write, epoch millis
    pub timestamp_ms: i64,
    pub priority: Priority,
    pub retry_count: u32,
}

impl SyncOperation {
    #[must_use]
    pub fn new(
        op: Operation,
        table: String,
        record_id: String,
        fields: Value,
        priority: Priority,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            op,
            table,
            record_id,
            fields,
            timestamp_ms: now_millis(),
            priority,
            retry_count: 0,
        }
    }
}

#[derive(Default)]
struct QueueInner {
    high: VecDeque<SyncOperation>,
    normal: VecDeque<SyncOperation>,
    low: VecDeque<SyncOperation>,
    dead: VecDeque<SyncOperation>,
}

/// Strict-priority FIFO queue with a dead-letter buffer.
#[derive(Default)]
pub struct SyncQueue {
    inner: Mutex<QueueInner>,
}

impl SyncQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, op: SyncOperation) {
        let mut inner = self.inner.lock();
        match op.priority {
            Priority::High => inner.high.push_back(op),
            Priority::Normal => inner.normal.push_back(op),
            Priority::Low => inner.low.push_back(op),
        }
        crate::metrics::set_queue_depth(inner.high.len() + inner.normal.len() + inner.low.len());
    }

    /// Next operation to push: highest non-empty band, oldest first.
    pub fn pop(&self) -> Option<SyncOperation> {
        let mut inner = self.inner.lock();
        inner
            .high
            .pop_front()
            .or_else(|| inner.normal.pop_front())
            .or_else(|| inner.low.pop_front())
    }

    /// Put a failed operation back at the tail of its band. Later
    /// operations in the band get a turn before the retry.
    pub fn requeue(&self, op: SyncOperation) {
        let mut inner = self.inner.lock();
        match op.priority {
            Priority::High => inner.high.push_back(op),
            Priority::Normal => inner.normal.push_back(op),
            Priority::Low => inner.low.push_back(op),
        }
    }

    /// Park an operation that exhausted its retries.
    pub fn dead_letter(&self, op: SyncOperation) {
        warn!(
            table = %op.table,
            record_id = %op.record_id,
            retries = op.retry_count,
            "Operation moved to dead-letter buffer"
        );
        let mut inner = self.inner.lock();
        if inner.dead.len() >= DEAD_LETTER_CAP {
            inner.dead.pop_front();
        }
        inner.dead.push_back(op);
        crate::metrics::set_dead_letter_depth(inner.dead.len());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.high.len() + inner.normal.len() + inner.low.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn dead_len(&self) -> usize {
        self.inner.lock().dead.len()
    }

    /// Snapshot of the dead-letter buffer, oldest first.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<SyncOperation> {
        self.inner.lock().dead.iter().cloned().collect()
    }

    /// Drop every queued operation targeting the record, across all
    /// bands. Used when a pulled remote change supersedes pending local
    /// work. Returns how many were removed.
    pub fn remove_pending_for(&self, table: &str, record_id: &str) -> usize {
        let inner = &mut *self.inner.lock();
        let mut removed = 0;
        for band in [&mut inner.high, &mut inner.normal, &mut inner.low] {
            let before = band.len();
            band.retain(|op| op.table != table || op.record_id != record_id);
            removed += before - band.len();
        }
        crate::metrics::set_queue_depth(inner.high.len() + inner.normal.len() + inner.low.len());
        removed
    }

    /// Whether any queued (not dead-lettered) operation targets the record.
    #[must_use]
    pub fn has_pending_for(&self, table: &str, record_id: &str) -> bool {
        let inner = self.inner.lock();
        [&inner.high, &inner.normal, &inner.low]
            .iter()
            .any(|band| {
                band.iter()
                    .any(|op| op.table == table && op.record_id == record_id)
            })
    }

    /// Newest queued timestamp targeting the record, if any.
    #[must_use]
    pub fn pending_timestamp_for(&self, table: &str, record_id: &str) -> Option<i64> {
        let inner = self.inner.lock();
        [&inner.high, &inner.normal, &inner.low]
            .iter()
            .flat_map(|band| band.iter())
            .filter(|op| op.table == table && op.record_id == record_id)
            .map(|op| op.timestamp_ms)
            .max()
    }
}
