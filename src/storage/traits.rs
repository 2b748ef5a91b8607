use async_trait::async_trait;
use thiserror::Error;

use crate::record::Record;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Store is closed")]
    Closed,
}

/// Record-oriented persistence surface shared by the local and remote
/// stores. Callers address data by `(table, id)`, never by SQL.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch a single record, `None` if absent.
    async fn fetch(&self, table: &str, id: &str) -> Result<Option<Record>, StorageError>;

    /// All records in a table, unordered.
    async fn list(&self, table: &str) -> Result<Vec<Record>, StorageError>;

    /// Insert or replace a record, keyed by `(table, id)`.
    async fn upsert(&self, record: &Record) -> Result<(), StorageError>;

    /// Remove a record. Deleting an absent record is not an error.
    async fn delete(&self, table: &str, id: &str) -> Result<(), StorageError>;

    /// Records in a table whose `updated_at` is strictly greater than
    /// `since_ms`, ordered by `updated_at` ascending.
    async fn changed_since(&self, table: &str, since_ms: i64) -> Result<Vec<Record>, StorageError>;

    /// Names of every table with at least one record.
    async fn tables(&self) -> Result<Vec<String>, StorageError>;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<(), StorageError>;

    /// Release the backing connections. Further calls fail with
    /// [`StorageError::Closed`] or a backend error.
    async fn close(&self) -> Result<(), StorageError>;
}
