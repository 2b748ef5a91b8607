//! In-memory [`RecordStore`] for tests and ephemeral deployments.
//!
//! Supports fault injection (`set_failing`) and keeps a journal of write
//! order so tests can assert on push sequencing.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::traits::{RecordStore, StorageError};
use crate::record::Record;

#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<(String, String), Record>,
    failing: AtomicBool,
    closed: AtomicBool,
    /// `(table, id)` of every upsert/delete, in arrival order
    journal: Mutex<Vec<(String, String)>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, every operation fails with a backend error until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Write order observed so far, oldest first.
    #[must_use]
    pub fn journal(&self) -> Vec<(String, String)> {
        self.journal.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        if self.failing.load(Ordering::Acquire) {
            return Err(StorageError::Backend("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn fetch(&self, table: &str, id: &str) -> Result<Option<Record>, StorageError> {
        self.check_available()?;
        Ok(self
            .records
            .get(&(table.to_string(), id.to_string()))
            .map(|r| r.clone()))
    }

    async fn list(&self, table: &str) -> Result<Vec<Record>, StorageError> {
        self.check_available()?;
        Ok(self
            .records
            .iter()
            .filter(|e| e.key().0 == table)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn upsert(&self, record: &Record) -> Result<(), StorageError> {
        self.check_available()?;
        self.journal
            .lock()
            .push((record.table.clone(), record.id.clone()));
        self.records
            .insert((record.table.clone(), record.id.clone()), record.clone());
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), StorageError> {
        self.check_available()?;
        self.journal
            .lock()
            .push((table.to_string(), id.to_string()));
        self.records.remove(&(table.to_string(), id.to_string()));
        Ok(())
    }

    async fn changed_since(&self, table: &str, since_ms: i64) -> Result<Vec<Record>, StorageError> {
        self.check_available()?;
        let mut changed: Vec<Record> = self
            .records
            .iter()
            .filter(|e| e.key().0 == table && e.value().updated_at > since_ms)
            .map(|e| e.value().clone())
            .collect();
        changed.sort_by_key(|r| r.updated_at);
        Ok(changed)
    }

    async fn tables(&self) -> Result<Vec<String>, StorageError> {
        self.check_available()?;
        let mut tables: Vec<String> = self.records.iter().map(|e| e.key().0.clone()).collect();
        tables.sort();
        tables.dedup();
        Ok(tables)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.check_available()
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_basic_round_trip() {
        let store = MemoryStore::new();
        let record = Record::new("users".into(), "u-1".into(), json!({"name": "Ada"}));
        store.upsert(&record).await.unwrap();

        let fetched = store.fetch("users", "u-1").await.unwrap().unwrap();
        assert_eq!(fetched.fields["name"], "Ada");

        store.delete("users", "u-1").await.unwrap();
        assert!(store.fetch("users", "u-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_changed_since_filters_and_sorts() {
        let store = MemoryStore::new();
        for (id, ts) in [("a", 50), ("b", 200), ("c", 100)] {
            let record = Record::with_timestamp("t".into(), id.into(), json!({}), ts);
            store.upsert(&record).await.unwrap();
        }

        let changed = store.changed_since("t", 50).await.unwrap();
        let ids: Vec<&str> = changed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryStore::new();
        store.set_failing(true);

        assert!(store.ping().await.is_err());
        assert!(store
            .upsert(&Record::new("t".into(), "a".into(), json!({})))
            .await
            .is_err());

        store.set_failing(false);
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_journal_records_write_order() {
        let store = MemoryStore::new();
        store
            .upsert(&Record::new("t".into(), "first".into(), json!({})))
            .await
            .unwrap();
        store.delete("t", "second").await.unwrap();

        let journal = store.journal();
        assert_eq!(
            journal,
            vec![
                ("t".to_string(), "first".to_string()),
                ("t".to_string(), "second".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_rejects() {
        let store = MemoryStore::new();
        store.close().await.unwrap();
        assert!(matches!(store.ping().await, Err(StorageError::Closed)));
    }
}
