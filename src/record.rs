//! Record data structure.
//!
//! The [`Record`] is the unit of data that flows between the cache, the
//! local store, and the remote store. A record is identified by its
//! `(table, id)` pair and carries a JSON field map plus the wall-clock
//! timestamp of its last modification.

use std::sync::OnceLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current wall-clock time as epoch milliseconds.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A single row as seen by the sync engine.
///
/// # Example
///
/// ```
/// use dualsync::Record;
/// use serde_json::json;
///
/// let record = Record::new(
///     "channels".into(),
///     "general".into(),
///     json!({"name": "general", "topic": "Anything goes"}),
/// );
///
/// assert_eq!(record.table, "channels");
/// assert_eq!(record.id, "general");
/// assert!(record.updated_at > 0);
/// assert!(record.size_bytes() > 0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Logical table name (e.g. `channels`, `messages`)
    pub table: String,
    /// Record ID, unique within a table
    pub id: String,
    /// Field map (always a JSON object)
    pub fields: Value,
    /// Last modification timestamp (epoch millis)
    pub updated_at: i64,

    /// Cached computed size in bytes (lazily computed, not serialized)
    #[serde(skip)]
    cached_size: OnceLock<usize>,
}

impl Record {
    /// Create a record stamped with the current wall-clock time.
    pub fn new(table: String, id: String, fields: Value) -> Self {
        Self::with_timestamp(table, id, fields, now_millis())
    }

    /// Create a record with an explicit modification timestamp.
    pub fn with_timestamp(table: String, id: String, fields: Value, updated_at: i64) -> Self {
        Self {
            table,
            id,
            fields,
            updated_at,
            cached_size: OnceLock::new(),
        }
    }

    /// Approximate in-memory size: struct overhead + key strings + JSON payload.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        *self.cached_size.get_or_init(|| {
            std::mem::size_of::<Self>()
                + self.table.len()
                + self.id.len()
                + self.fields.to_string().len()
        })
    }
}
