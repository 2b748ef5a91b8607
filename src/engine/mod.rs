// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Push/pull synchronization between the local and remote stores.
//!
//! The push loop drains the [`SyncQueue`] toward the remote store; the
//! pull loop replicates remote changes back using per-table watermarks
//! over `updated_at`. Conflicts are resolved last-write-wins and logged.
//!
//! Both loops are also exposed as single-step `tick` methods so tests
//! (and embedders that want manual scheduling) can drive the engine
//! without background tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::cache::MemoryCache;
use crate::conflict::{ConflictLog, Resolution};
use crate::queue::{Operation, Priority, SyncOperation, SyncQueue};
use crate::record::Record;
use crate::resilience::BackendHealth;
use crate::stats::StatsCollector;
use crate::storage::{RecordStore, StorageError};

pub struct SyncEngine {
    local: Arc<dyn RecordStore>,
    remote: Arc<dyn RecordStore>,
    cache: Arc<MemoryCache>,
    queue: Arc<SyncQueue>,
    conflicts: Arc<ConflictLog>,
    stats: Arc<StatsCollector>,
    local_health: Arc<BackendHealth>,
    remote_health: Arc<BackendHealth>,
    /// Highest remote `updated_at` already pulled, per table
    watermarks: Mutex<HashMap<String, i64>>,
    retry_limit: u32,
    push_interval_ms: u64,
    /// Shared with the optimizer, which stretches it under queue pressure
    pull_interval_ms: Arc<AtomicU64>,
    running: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
}

#[allow(clippy::too_many_arguments)]
impl SyncEngine {
    pub fn new(
        local: Arc<dyn RecordStore>,
        remote: Arc<dyn RecordStore>,
        cache: Arc<MemoryCache>,
        queue: Arc<SyncQueue>,
        conflicts: Arc<ConflictLog>,
        stats: Arc<StatsCollector>,
        local_health: Arc<BackendHealth>,
        remote_health: Arc<BackendHealth>,
        retry_limit: u32,
        push_interval_ms: u64,
        pull_interval_ms: Arc<AtomicU64>,
    ) -> Self {
        Self {
            local,
            remote,
            cache,
            queue,
            conflicts,
            stats,
            local_health,
            remote_health,
            watermarks: Mutex::new(HashMap::new()),
            retry_limit,
            push_interval_ms,
            pull_interval_ms,
            running: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
            shutdown_tx: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Push one queued operation to the remote store.
    ///
    /// Returns `true` if an operation was taken off the queue (whether it
    /// succeeded, was requeued, or was dead-lettered).
    pub async fn push_tick(&self) -> bool {
        let Some(mut op) = self.queue.pop() else {
            return false;
        };

        let timer = crate::metrics::LatencyTimer::new("remote", "push");
        let result = self.apply_remote(&op).await;
        let elapsed_ms = timer.elapsed().as_secs_f64() * 1000.0;
        drop(timer);

        match result {
            Ok(()) => {
                self.remote_health.record_success();
                self.stats.record_success(elapsed_ms);
                crate::metrics::record_operation("remote", "push", "success");
                debug!(table = %op.table, record_id = %op.record_id, "Pushed operation");
            }
            Err(err) => {
                self.remote_health.record_failure();
                self.stats.record_failure();
                crate::metrics::record_operation("remote", "push", "error");
                op.retry_count += 1;
                if op.retry_count > self.retry_limit {
                    self.stats.record_dead_letter();
                    self.queue.dead_letter(op);
                } else {
                    debug!(
                        retry = op.retry_count,
                        limit = self.retry_limit,
                        "Push failed, requeueing: {}", err
                    );
                    self.queue.requeue(op);
                }
            }
        }
        true
    }

    async fn apply_remote(&self, op: &SyncOperation) -> Result<(), StorageError> {
        match op.op {
            Operation::Delete => self.remote.delete(&op.table, &op.record_id).await,
            Operation::Insert | Operation::Update => {
                let record = Record::with_timestamp(
                    op.table.clone(),
                    op.record_id.clone(),
                    op.fields.clone(),
                    op.timestamp_ms,
                );
                self.remote.upsert(&record).await
            }
        }
    }

    /// Pull remote changes newer than each table's watermark into the
    /// local store. Returns the number of rows examined.
    pub async fn pull_tick(&self) -> Result<usize, StorageError> {
        let tables = match self.remote.tables().await {
            Ok(tables) => {
                self.remote_health.record_success();
                tables
            }
            Err(err) => {
                self.remote_health.record_failure();
                return Err(err);
            }
        };

        let mut examined = 0;
        for table in tables {
            let watermark = self.watermark(&table);
            let rows = self.remote.changed_since(&table, watermark).await?;
            if rows.is_empty() {
                continue;
            }

            crate::metrics::record_pull_rows(&table, rows.len());
            let mut new_watermark = watermark;
            for remote_row in rows {
                examined += 1;
                new_watermark = new_watermark.max(remote_row.updated_at);
                self.merge_remote_row(watermark, remote_row).await?;
            }
            self.set_watermark(&table, new_watermark);
        }
        Ok(examined)
    }

    /// Fold one remote row into the local store, resolving a conflict if
    /// the record also changed locally since the last pull.
    async fn merge_remote_row(
        &self,
        table_watermark: i64,
        remote_row: Record,
    ) -> Result<(), StorageError> {
        let table = remote_row.table.clone();
        let id = remote_row.id.clone();

        let local_row = self.local_fetch(&table, &id).await?;

        // A row we pushed ourselves comes straight back from
        // changed_since. Identical timestamp and payload means there is
        // nothing to merge and no conflict to report.
        if let Some(ref local) = local_row {
            if local.updated_at == remote_row.updated_at && local.fields == remote_row.fields {
                return Ok(());
            }
        }

        let locally_changed = match &local_row {
            Some(local) => {
                self.queue.has_pending_for(&table, &id) || local.updated_at > table_watermark
            }
            None => self.queue.has_pending_for(&table, &id),
        };

        if locally_changed {
            let local_ts = self
                .queue
                .pending_timestamp_for(&table, &id)
                .or_else(|| local_row.as_ref().map(|l| l.updated_at))
                .unwrap_or(0);
            let local_fields = local_row
                .as_ref()
                .map(|l| l.fields.clone())
                .unwrap_or(serde_json::Value::Null);

            let resolution = self.conflicts.record(
                &table,
                &id,
                local_fields,
                remote_row.fields.clone(),
                local_ts,
                remote_row.updated_at,
            );
            self.stats.record_conflict();

            match resolution {
                Resolution::RemoteWins => {
                    // Pending local pushes for this record carry the losing
                    // value; letting them run would overwrite the winner on
                    // the remote at an older timestamp the watermark never
                    // revisits.
                    let dropped = self.queue.remove_pending_for(&table, &id);
                    if dropped > 0 {
                        debug!(
                            table = %table,
                            record_id = %id,
                            dropped,
                            "Cancelled queued pushes superseded by remote change"
                        );
                    }
                    self.local_upsert(&remote_row).await?;
                    self.cache.insert(remote_row);
                }
                Resolution::LocalWins => {
                    // The local version must reach the remote. If a push is
                    // already queued it will carry the newer value; if not
                    // (the local write predates this session's queue),
                    // schedule one now.
                    if !self.queue.has_pending_for(&table, &id) {
                        if let Some(local) = local_row {
                            self.queue.enqueue(SyncOperation {
                                timestamp_ms: local.updated_at,
                                ..SyncOperation::new(
                                    Operation::Update,
                                    table,
                                    id,
                                    local.fields,
                                    Priority::High,
                                )
                            });
                        }
                    }
                }
            }
        } else {
            self.local_upsert(&remote_row).await?;
            self.cache.insert(remote_row);
        }
        Ok(())
    }

    async fn local_fetch(&self, table: &str, id: &str) -> Result<Option<Record>, StorageError> {
        match self.local.fetch(table, id).await {
            Ok(row) => {
                self.local_health.record_success();
                Ok(row)
            }
            Err(err) => {
                self.local_health.record_failure();
                Err(err)
            }
        }
    }

    async fn local_upsert(&self, record: &Record) -> Result<(), StorageError> {
        match self.local.upsert(record).await {
            Ok(()) => {
                self.local_health.record_success();
                Ok(())
            }
            Err(err) => {
                self.local_health.record_failure();
                Err(err)
            }
        }
    }

    fn watermark(&self, table: &str) -> i64 {
        *self.watermarks.lock().get(table).unwrap_or(&0)
    }

    fn set_watermark(&self, table: &str, value: i64) {
        self.watermarks.lock().insert(table.to_string(), value);
    }

    /// Spawn the push and pull loops. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let (tx, rx) = watch::channel(false);
        *self.shutdown_tx.lock() = Some(tx);

        let push_engine = Arc::clone(self);
        let mut push_rx = rx.clone();
        let push_handle = tokio::spawn(async move {
            let interval = Duration::from_millis(push_engine.push_interval_ms.max(1));
            loop {
                tokio::select! {
                    _ = push_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {
                        // Drain everything queued since the last tick
                        while push_engine.push_tick().await {}
                    }
                }
            }
            debug!("Push loop stopped");
        });

        let pull_engine = Arc::clone(self);
        let mut pull_rx = rx;
        let pull_handle = tokio::spawn(async move {
            loop {
                let interval = Duration::from_millis(
                    pull_engine.pull_interval_ms.load(Ordering::Acquire).max(1),
                );
                tokio::select! {
                    _ = pull_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = pull_engine.pull_tick().await {
                            error!("Pull pass failed: {}", err);
                        }
                    }
                }
            }
            debug!("Pull loop stopped");
        });

        self.handles.lock().extend([push_handle, pull_handle]);
        info!("Sync loops started");
    }

    /// Stop the loops and wait for them to exit. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(true);
        }
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("Sync loops stopped");
    }

    /// Push up to `max_ops` queued operations, stopping early if the
    /// remote store is unhealthy. Used during shutdown drain.
    pub async fn drain(&self, max_ops: usize) -> usize {
        let mut pushed = 0;
        for _ in 0..max_ops {
            if !self.remote_health.is_healthy() {
                break;
            }
            if !self.push_tick().await {
                break;
            }
            pushed += 1;
        }
        pushed
    }
}
