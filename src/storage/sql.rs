// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL storage backend for both the local (SQLite) and remote (MySQL)
//! stores, via sqlx's `Any` driver.
//!
//! Every record lives in a single table, keyed by `(tbl, id)`:
//! ```sql
//! CREATE TABLE records (
//!   tbl VARCHAR(64) NOT NULL,
//!   id VARCHAR(255) NOT NULL,
//!   fields LONGTEXT NOT NULL,   -- JSON as text (sqlx Any driver limitation)
//!   updated_at BIGINT NOT NULL, -- epoch milliseconds
//!   PRIMARY KEY (tbl, id)
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! We use TEXT instead of native JSON type because sqlx's `Any` driver:
//! 1. Doesn't support MySQL's JSON type mapping
//! 2. Treats LONGTEXT/TEXT as BLOB (requires reading as `Vec<u8>` then converting)
//!
//! JSON functions still work on TEXT columns:
//!
//! ```sql
//! -- Find users named Alice
//! SELECT * FROM records WHERE JSON_EXTRACT(fields, '$.name') = 'Alice';
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use tracing::info;

use super::traits::{RecordStore, StorageError};
use crate::record::Record;
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
    closed: AtomicBool,
}

impl SqlStore {
    /// Open the embedded local store at a filesystem path ("`:memory:`"
    /// works for tests). The database file is created if absent.
    pub async fn open_local(path: &str) -> Result<Self, StorageError> {
        let url = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };
        info!(path, "Opening local SQLite store");
        Self::connect(&url).await
    }

    /// Connect to the remote store by connection URL (`mysql://...` or a
    /// `sqlite:` URL when a second embedded database stands in).
    pub async fn open_remote(url: &str) -> Result<Self, StorageError> {
        info!("Connecting to remote store");
        Self::connect(url).await
    }

    /// Connect with startup-mode retry (fails fast if config is wrong).
    async fn connect(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 1 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self {
            pool,
            is_sqlite,
            closed: AtomicBool::new(false),
        };

        // WAL mode: concurrent reads during writes, single fsync per commit
        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        // WAL mode is safe with NORMAL (FULL is the non-WAL default)
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        // TEXT/LONGTEXT instead of native JSON because sqlx's `Any` driver
        // doesn't support MySQL's JSON type mapping. The data is still valid
        // JSON and can be queried with JSON_EXTRACT() in MySQL.
        let sql = if self.is_sqlite {
            r#"
            CREATE TABLE IF NOT EXISTS records (
                tbl TEXT NOT NULL,
                id TEXT NOT NULL,
                fields TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (tbl, id)
            )
            "#
        } else {
            r#"
            CREATE TABLE IF NOT EXISTS records (
                tbl VARCHAR(64) NOT NULL,
                id VARCHAR(255) NOT NULL,
                fields LONGTEXT NOT NULL,
                updated_at BIGINT NOT NULL,
                PRIMARY KEY (tbl, id),
                INDEX idx_updated_at (tbl, updated_at)
            )
            "#
        };

        retry("sql_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await?;

        // SQLite can't declare secondary indexes inline
        if self.is_sqlite {
            sqlx::query("CREATE INDEX IF NOT EXISTS idx_updated_at ON records (tbl, updated_at)")
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }

        Ok(())
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn row_to_record(table: &str, row: &sqlx::any::AnyRow) -> Result<Record, StorageError> {
        let id: String = row
            .try_get("id")
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        // Try reading fields as String first (SQLite TEXT), then as bytes (MySQL LONGTEXT)
        let fields_json: String = row
            .try_get::<String, _>("fields")
            .ok()
            .or_else(|| {
                row.try_get::<Vec<u8>, _>("fields")
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
            })
            .ok_or_else(|| StorageError::Backend("No fields payload in row".to_string()))?;

        let fields = serde_json::from_str(&fields_json)
            .map_err(|e| StorageError::Backend(format!("Malformed fields JSON: {}", e)))?;

        let updated_at: i64 = row
            .try_get("updated_at")
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(Record::with_timestamp(
            table.to_string(),
            id,
            fields,
            updated_at,
        ))
    }
}

#[async_trait]
impl RecordStore for SqlStore {
    async fn fetch(&self, table: &str, id: &str) -> Result<Option<Record>, StorageError> {
        self.check_open()?;
        let table = table.to_string();
        let id = id.to_string();

        retry("sql_fetch", &RetryConfig::query(), || async {
            let result = sqlx::query(
                "SELECT id, fields, updated_at FROM records WHERE tbl = ? AND id = ?",
            )
            .bind(&table)
            .bind(&id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

            match result {
                Some(row) => Ok(Some(Self::row_to_record(&table, &row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list(&self, table: &str) -> Result<Vec<Record>, StorageError> {
        self.check_open()?;
        let table = table.to_string();

        retry("sql_list", &RetryConfig::query(), || async {
            let rows = sqlx::query("SELECT id, fields, updated_at FROM records WHERE tbl = ?")
                .bind(&table)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            rows.iter()
                .map(|row| Self::row_to_record(&table, row))
                .collect()
        })
        .await
    }

    async fn upsert(&self, record: &Record) -> Result<(), StorageError> {
        self.check_open()?;
        let fields_json = record.fields.to_string();

        let sql = if self.is_sqlite {
            "INSERT INTO records (tbl, id, fields, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(tbl, id) DO UPDATE SET
                fields = excluded.fields,
                updated_at = excluded.updated_at"
        } else {
            "INSERT INTO records (tbl, id, fields, updated_at)
             VALUES (?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                fields = VALUES(fields),
                updated_at = VALUES(updated_at)"
        };

        retry("sql_upsert", &RetryConfig::query(), || async {
            sqlx::query(sql)
                .bind(&record.table)
                .bind(&record.id)
                .bind(&fields_json)
                .bind(record.updated_at)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), StorageError> {
        self.check_open()?;
        let table = table.to_string();
        let id = id.to_string();

        retry("sql_delete", &RetryConfig::query(), || async {
            sqlx::query("DELETE FROM records WHERE tbl = ? AND id = ?")
                .bind(&table)
                .bind(&id)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn changed_since(&self, table: &str, since_ms: i64) -> Result<Vec<Record>, StorageError> {
        self.check_open()?;
        let table = table.to_string();

        retry("sql_changed_since", &RetryConfig::query(), || async {
            let rows = sqlx::query(
                "SELECT id, fields, updated_at FROM records
                 WHERE tbl = ? AND updated_at > ?
                 ORDER BY updated_at ASC",
            )
            .bind(&table)
            .bind(since_ms)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

            rows.iter()
                .map(|row| Self::row_to_record(&table, row))
                .collect()
        })
        .await
    }

    async fn tables(&self) -> Result<Vec<String>, StorageError> {
        self.check_open()?;

        retry("sql_tables", &RetryConfig::query(), || async {
            let rows = sqlx::query("SELECT DISTINCT tbl FROM records ORDER BY tbl")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

            rows.iter()
                .map(|row| {
                    row.try_get::<String, _>("tbl")
                        .ok()
                        .or_else(|| {
                            row.try_get::<Vec<u8>, _>("tbl")
                                .ok()
                                .and_then(|bytes| String::from_utf8(bytes).ok())
                        })
                        .ok_or_else(|| StorageError::Backend("Unreadable table name".to_string()))
                })
                .collect()
        })
        .await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.check_open()?;
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn file_store(dir: &TempDir) -> SqlStore {
        let path = dir.path().join("local.db");
        SqlStore::open_local(path.to_str().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn test_upsert_and_fetch() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir).await;

        let record = Record::new("users".into(), "u-1".into(), json!({"name": "Ada"}));
        store.upsert(&record).await.unwrap();

        let fetched = store.fetch("users", "u-1").await.unwrap().unwrap();
        assert_eq!(fetched.fields["name"], "Ada");
        assert_eq!(fetched.updated_at, record.updated_at);
    }

    #[tokio::test]
    async fn test_fetch_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir).await;
        assert!(store.fetch("users", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir).await;

        let v1 = Record::with_timestamp("t".into(), "a".into(), json!({"v": 1}), 100);
        let v2 = Record::with_timestamp("t".into(), "a".into(), json!({"v": 2}), 200);
        store.upsert(&v1).await.unwrap();
        store.upsert(&v2).await.unwrap();

        let fetched = store.fetch("t", "a").await.unwrap().unwrap();
        assert_eq!(fetched.fields["v"], 2);
        assert_eq!(fetched.updated_at, 200);
        assert_eq!(store.list("t").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir).await;

        let record = Record::new("t".into(), "a".into(), json!({}));
        store.upsert(&record).await.unwrap();

        store.delete("t", "a").await.unwrap();
        store.delete("t", "a").await.unwrap();
        assert!(store.fetch("t", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_changed_since_ordering_and_cutoff() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir).await;

        for (id, ts) in [("a", 300), ("b", 100), ("c", 200)] {
            let record = Record::with_timestamp("t".into(), id.into(), json!({}), ts);
            store.upsert(&record).await.unwrap();
        }

        let changed = store.changed_since("t", 100).await.unwrap();
        let ids: Vec<&str> = changed.iter().map(|r| r.id.as_str()).collect();
        // Strictly-greater cutoff, ascending by timestamp
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_tables_lists_distinct() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir).await;

        for table in ["users", "posts", "users"] {
            let record = Record::new(table.into(), format!("id-{}", table), json!({}));
            store.upsert(&record).await.unwrap();
        }

        let tables = store.tables().await.unwrap();
        assert_eq!(tables, vec!["posts".to_string(), "users".to_string()]);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("local.db");

        {
            let store = SqlStore::open_local(path.to_str().unwrap()).await.unwrap();
            let record = Record::new("t".into(), "persist".into(), json!({"x": true}));
            store.upsert(&record).await.unwrap();
            store.close().await.unwrap();
        }

        let store = SqlStore::open_local(path.to_str().unwrap()).await.unwrap();
        let fetched = store.fetch("t", "persist").await.unwrap().unwrap();
        assert_eq!(fetched.fields["x"], true);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir).await;
        store.close().await.unwrap();

        let result = store.fetch("t", "a").await;
        assert!(matches!(result, Err(StorageError::Closed)));

        // Closing twice is fine
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_ping() {
        let dir = TempDir::new().unwrap();
        let store = file_store(&dir).await;
        store.ping().await.unwrap();
    }
}
