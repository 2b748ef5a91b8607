// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! `DataSyncService`: the single data-access facade.
//!
//! One instance is constructed at process start and passed explicitly to
//! whatever needs it. Reads come from the cache, falling back to the
//! local store; writes commit locally and are queued for the remote, so
//! no caller ever waits on the network.
//!
//! Lifecycle: `Created → Initializing → Running → ShuttingDown → Stopped`,
//! broadcast over a `watch` channel so embedders can observe transitions.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::cache::{CacheConfig, CacheInfo, MemoryCache};
use crate::config::DualSyncConfig;
use crate::conflict::{ConflictLog, ConflictRecord};
use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::monitor::{ResourceMonitor, ResourceSample};
use crate::optimizer::AutoOptimizer;
use crate::queue::{Operation, Priority, SyncOperation, SyncQueue};
use crate::record::Record;
use crate::resilience::{BackendHealth, ConnectionStatus};
use crate::stats::{StatsCollector, SyncStats};
use crate::storage::{RecordStore, SqlStore};

/// Facade lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Created => "Created",
            ServiceState::Initializing => "Initializing",
            ServiceState::Running => "Running",
            ServiceState::ShuttingDown => "ShuttingDown",
            ServiceState::Stopped => "Stopped",
        };
        write!(f, "{}", name)
    }
}

pub struct DataSyncService {
    config: DualSyncConfig,
    local: Arc<dyn RecordStore>,
    remote: Arc<dyn RecordStore>,
    cache: Arc<MemoryCache>,
    queue: Arc<SyncQueue>,
    conflicts: Arc<ConflictLog>,
    stats: Arc<StatsCollector>,
    monitor: Arc<ResourceMonitor>,
    optimizer: Arc<AutoOptimizer>,
    local_health: Arc<BackendHealth>,
    remote_health: Arc<BackendHealth>,
    engine: Arc<SyncEngine>,
    state_tx: watch::Sender<ServiceState>,
    /// Held so the channel survives with no external subscribers
    _state_rx: watch::Receiver<ServiceState>,
    advanced_started: AtomicBool,
    aux_handles: Mutex<Vec<JoinHandle<()>>>,
    aux_shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl DataSyncService {
    /// Connect both stores from the config and build the service.
    ///
    /// `local_path` and `remote_url` must both be set; use
    /// [`DataSyncService::with_stores`] to supply stores directly (tests,
    /// or deployments without a remote).
    pub async fn connect(config: DualSyncConfig) -> Result<Self, SyncError> {
        let local_path = config
            .local_path
            .clone()
            .ok_or_else(|| SyncError::Connection("local_path is not configured".into()))?;
        let remote_url = config
            .remote_url
            .clone()
            .ok_or_else(|| SyncError::Connection("remote_url is not configured".into()))?;

        let local = SqlStore::open_local(&local_path)
            .await
            .map_err(|e| SyncError::Connection(e.to_string()))?;
        let remote = SqlStore::open_remote(&remote_url)
            .await
            .map_err(|e| SyncError::Connection(e.to_string()))?;

        Ok(Self::with_stores(config, Arc::new(local), Arc::new(remote)))
    }

    /// Build the service around already-connected stores.
    pub fn with_stores(
        config: DualSyncConfig,
        local: Arc<dyn RecordStore>,
        remote: Arc<dyn RecordStore>,
    ) -> Self {
        let cache_config = CacheConfig {
            max_memory_bytes: config.cache_max_memory_bytes,
            max_entries: config.cache_max_entries,
            ttl_secs: config.cache_ttl_secs,
            gc_interval_secs: config.cache_gc_interval_secs,
        };
        let cache = Arc::new(MemoryCache::new(cache_config.clone()));
        let queue = Arc::new(SyncQueue::new());
        let conflicts = Arc::new(ConflictLog::default());
        let stats = Arc::new(StatsCollector::new());
        let monitor = Arc::new(ResourceMonitor::new(config.resource_history_cap));
        let local_health = Arc::new(BackendHealth::new("local"));
        let remote_health = Arc::new(BackendHealth::new("remote"));
        let pull_interval_ms = Arc::new(AtomicU64::new(config.pull_interval_ms));
        let optimizer = Arc::new(AutoOptimizer::new(cache_config, pull_interval_ms.clone()));

        let engine = Arc::new(SyncEngine::new(
            local.clone(),
            remote.clone(),
            cache.clone(),
            queue.clone(),
            conflicts.clone(),
            stats.clone(),
            local_health.clone(),
            remote_health.clone(),
            config.retry_limit,
            config.push_interval_ms,
            pull_interval_ms,
        ));

        let (state_tx, state_rx) = watch::channel(ServiceState::Created);
        crate::metrics::set_service_state("Created");

        Self {
            config,
            local,
            remote,
            cache,
            queue,
            conflicts,
            stats,
            monitor,
            optimizer,
            local_health,
            remote_health,
            engine,
            state_tx,
            _state_rx: state_rx,
            advanced_started: AtomicBool::new(false),
            aux_handles: Mutex::new(Vec::new()),
            aux_shutdown: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn state(&self) -> ServiceState {
        *self.state_tx.borrow()
    }

    /// Subscribe to lifecycle transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ServiceState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ServiceState) {
        info!(%state, "Service state transition");
        crate::metrics::set_service_state(&state.to_string());
        let _ = self.state_tx.send(state);
    }

    fn ensure_running(&self) -> Result<(), SyncError> {
        match self.state() {
            ServiceState::ShuttingDown | ServiceState::Stopped => Err(SyncError::NotRunning),
            _ => Ok(()),
        }
    }

    /// Read a single record: cache first, local store on a miss (which
    /// repopulates the cache). Never touches the remote store.
    #[instrument(skip_all, fields(table = %table, id = %id))]
    pub async fn read(&self, table: &str, id: &str) -> Result<Option<Record>, SyncError> {
        self.ensure_running()?;

        if let Some(record) = self.cache.get(table, id) {
            return Ok(Some(record));
        }

        let _timer = crate::metrics::LatencyTimer::new("local", "fetch");
        match self.local.fetch(table, id).await {
            Ok(Some(record)) => {
                self.local_health.record_success();
                self.cache.insert(record.clone());
                Ok(Some(record))
            }
            Ok(None) => {
                self.local_health.record_success();
                Ok(None)
            }
            Err(err) => {
                self.local_health.record_failure();
                Err(SyncError::Read(err))
            }
        }
    }

    /// All records in a table, from the local store.
    #[instrument(skip_all, fields(table = %table))]
    pub async fn read_all(&self, table: &str) -> Result<Vec<Record>, SyncError> {
        self.ensure_running()?;

        match self.local.list(table).await {
            Ok(records) => {
                self.local_health.record_success();
                Ok(records)
            }
            Err(err) => {
                self.local_health.record_failure();
                Err(SyncError::Read(err))
            }
        }
    }

    /// Commit a write locally and queue it for the remote at normal
    /// priority. Returns once the local commit is durable; remote
    /// propagation is asynchronous and surfaces only through stats.
    pub async fn write(
        &self,
        table: &str,
        op: Operation,
        record_id: &str,
        fields: Value,
    ) -> Result<(), SyncError> {
        self.write_with_priority(table, op, record_id, fields, Priority::Normal)
            .await
    }

    #[instrument(skip_all, fields(table = %table, record_id = %record_id, op = ?op))]
    pub async fn write_with_priority(
        &self,
        table: &str,
        op: Operation,
        record_id: &str,
        fields: Value,
        priority: Priority,
    ) -> Result<(), SyncError> {
        self.ensure_running()?;
        validate_write(table, record_id, op, &fields)?;

        let _timer = crate::metrics::LatencyTimer::new("local", "upsert");
        let operation = SyncOperation::new(
            op,
            table.to_string(),
            record_id.to_string(),
            fields.clone(),
            priority,
        );

        let local_result = match op {
            Operation::Delete => self.local.delete(table, record_id).await,
            Operation::Insert | Operation::Update => {
                let record = Record::with_timestamp(
                    table.to_string(),
                    record_id.to_string(),
                    fields,
                    operation.timestamp_ms,
                );
                self.local.upsert(&record).await
            }
        };

        match local_result {
            Ok(()) => self.local_health.record_success(),
            Err(err) => {
                self.local_health.record_failure();
                return Err(SyncError::Write(err));
            }
        }

        match op {
            Operation::Delete => self.cache.invalidate(table, record_id),
            Operation::Insert | Operation::Update => {
                self.cache.insert(Record::with_timestamp(
                    table.to_string(),
                    record_id.to_string(),
                    operation.fields.clone(),
                    operation.timestamp_ms,
                ));
            }
        }

        self.queue.enqueue(operation);
        Ok(())
    }

    /// Start the push/pull loops. Idempotent.
    pub fn start_sync(&self) {
        self.engine.start();
    }

    /// Stop the push/pull loops without shutting the service down.
    pub async fn stop_sync(&self) {
        self.engine.stop().await;
    }

    /// Start every background task: push/pull sync, cache GC, resource
    /// sampling, and the optimizer. Idempotent.
    pub fn initialize_advanced_features(&self) {
        if self.advanced_started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(ServiceState::Initializing);

        self.start_sync();

        let (tx, rx) = watch::channel(false);
        *self.aux_shutdown.lock() = Some(tx);

        // Cache GC
        let gc_cache = self.cache.clone();
        let mut gc_rx = rx.clone();
        let gc_handle = tokio::spawn(async move {
            loop {
                let interval = gc_cache.gc_interval();
                tokio::select! {
                    _ = gc_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {
                        gc_cache.sweep_expired();
                    }
                }
            }
        });

        // Resource sampler: probe both backends, then record a sample
        let sampler_interval = Duration::from_secs(self.config.sample_interval_secs.max(1));
        let sampler_monitor = self.monitor.clone();
        let sampler_cache = self.cache.clone();
        let sampler_queue = self.queue.clone();
        let sampler_local = self.local.clone();
        let sampler_remote = self.remote.clone();
        let sampler_local_health = self.local_health.clone();
        let sampler_remote_health = self.remote_health.clone();
        let mut sampler_rx = rx.clone();
        let sampler_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sampler_rx.changed() => break,
                    _ = tokio::time::sleep(sampler_interval) => {
                        let local_ok = sampler_local_health.check(sampler_local.as_ref()).await;
                        let remote_ok = sampler_remote_health.check(sampler_remote.as_ref()).await;
                        sampler_monitor.collect(
                            &sampler_cache.info(),
                            sampler_queue.len(),
                            ConnectionStatus { local: local_ok, remote: remote_ok },
                        );
                    }
                }
            }
        });

        // Optimizer: react to the latest sample
        let optimizer = self.optimizer.clone();
        let optimizer_monitor = self.monitor.clone();
        let optimizer_cache = self.cache.clone();
        let optimizer_config = self.config.clone();
        let mut optimizer_rx = rx;
        let optimizer_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = optimizer_rx.changed() => break,
                    _ = tokio::time::sleep(sampler_interval) => {
                        if let Some(sample) = optimizer_monitor.latest() {
                            optimizer.optimize(&sample, &optimizer_cache, &optimizer_config);
                        }
                    }
                }
            }
        });

        self.aux_handles
            .lock()
            .extend([gc_handle, sampler_handle, optimizer_handle]);

        self.set_state(ServiceState::Running);
    }

    // ── Observability ──

    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.stats.snapshot()
    }

    /// Both backends' connectivity. A stopped service reports both down.
    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        if self.state() == ServiceState::Stopped {
            return ConnectionStatus::disconnected();
        }
        ConnectionStatus {
            local: self.local_health.is_healthy(),
            remote: self.remote_health.is_healthy(),
        }
    }

    #[must_use]
    pub fn conflict_log(&self) -> Vec<ConflictRecord> {
        self.conflicts.snapshot()
    }

    #[must_use]
    pub fn resource_history(&self) -> Vec<ResourceSample> {
        self.monitor.history()
    }

    #[must_use]
    pub fn cache_info(&self) -> CacheInfo {
        self.cache.info()
    }

    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        self.cache.config()
    }

    pub fn set_cache_config(&self, config: CacheConfig) {
        self.cache.set_config(config);
    }

    #[must_use]
    pub fn sync_queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Operations that exhausted their retries, oldest first.
    #[must_use]
    pub fn dead_letter(&self) -> Vec<SyncOperation> {
        self.queue.dead_letters()
    }

    /// Stop everything: cancel the background loops, attempt a bounded
    /// drain of the queue, close both stores. Idempotent; a second call
    /// returns immediately.
    pub async fn shutdown(&self) {
        match self.state() {
            ServiceState::Stopped | ServiceState::ShuttingDown => return,
            _ => {}
        }
        self.set_state(ServiceState::ShuttingDown);

        if let Some(tx) = self.aux_shutdown.lock().take() {
            let _ = tx.send(true);
        }
        let handles: Vec<JoinHandle<()>> = self.aux_handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        self.engine.stop().await;

        let drained = self.engine.drain(self.config.shutdown_drain_ops).await;
        let remaining = self.queue.len();
        if remaining > 0 {
            warn!(drained, remaining, "Shutdown drain left operations queued");
        } else {
            info!(drained, "Shutdown drain complete");
        }

        if let Err(err) = self.local.close().await {
            warn!("Closing local store failed: {}", err);
        }
        if let Err(err) = self.remote.close().await {
            warn!("Closing remote store failed: {}", err);
        }
        self.local_health.mark_down();
        self.remote_health.mark_down();

        self.set_state(ServiceState::Stopped);
    }
}

/// Table names are `[a-zA-Z0-9_]{1,64}`; record IDs are non-empty and at
/// most 255 bytes; insert/update payloads must be JSON objects.
fn validate_write(
    table: &str,
    record_id: &str,
    op: Operation,
    fields: &Value,
) -> Result<(), SyncError> {
    if table.is_empty() || table.len() > 64 {
        return Err(SyncError::Validation(format!(
            "table name must be 1-64 characters, got {}",
            table.len()
        )));
    }
    if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SyncError::Validation(format!(
            "table name '{}' contains invalid characters",
            table
        )));
    }
    if record_id.is_empty() || record_id.len() > 255 {
        return Err(SyncError::Validation(format!(
            "record ID must be 1-255 bytes, got {}",
            record_id.len()
        )));
    }
    if matches!(op, Operation::Insert | Operation::Update) && !fields.is_object() {
        return Err(SyncError::Validation(
            "fields must be a JSON object".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn service() -> (DataSyncService, Arc<MemoryStore>, Arc<MemoryStore>) {
        let local = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryStore::new());
        let svc = DataSyncService::with_stores(
            DualSyncConfig::default(),
            local.clone(),
            remote.clone(),
        );
        (svc, local, remote)
    }

    #[tokio::test]
    async fn test_read_your_writes() {
        let (svc, _, _) = service();
        svc.write("users", Operation::Insert, "u-1", json!({"name": "Ada"}))
            .await
            .unwrap();

        let record = svc.read("users", "u-1").await.unwrap().unwrap();
        assert_eq!(record.fields["name"], "Ada");
    }

    #[tokio::test]
    async fn test_write_does_not_touch_remote() {
        let (svc, _, remote) = service();
        remote.set_failing(true);

        svc.write("users", Operation::Insert, "u-1", json!({"a": 1}))
            .await
            .unwrap();

        assert_eq!(svc.sync_queue_len(), 1);
        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn test_read_falls_back_to_local_store() {
        let (svc, local, _) = service();
        let record = Record::new("t".into(), "seeded".into(), json!({"x": 1}));
        local.upsert(&record).await.unwrap();

        // Not cached yet; served from the local store and repopulated
        assert!(svc.read("t", "seeded").await.unwrap().is_some());
        assert!(svc.cache_info().entries >= 1);
    }

    #[tokio::test]
    async fn test_read_all() {
        let (svc, _, _) = service();
        for i in 0..3 {
            svc.write("posts", Operation::Insert, &format!("p-{}", i), json!({}))
                .await
                .unwrap();
        }

        assert_eq!(svc.read_all("posts").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_delete_invalidates_cache() {
        let (svc, _, _) = service();
        svc.write("t", Operation::Insert, "a", json!({"v": 1}))
            .await
            .unwrap();
        svc.read("t", "a").await.unwrap();

        svc.write("t", Operation::Delete, "a", Value::Null)
            .await
            .unwrap();

        assert!(svc.read("t", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_input() {
        let (svc, local, _) = service();

        let cases: Vec<(&str, &str, Value)> = vec![
            ("", "id", json!({})),
            ("bad-table!", "id", json!({})),
            ("t", "", json!({})),
            ("t", "id", json!("not an object")),
            ("t", "id", json!(42)),
        ];
        for (table, id, fields) in cases {
            let result = svc.write(table, Operation::Insert, id, fields).await;
            assert!(matches!(result, Err(SyncError::Validation(_))));
        }

        assert!(local.is_empty(), "nothing was committed");
        assert_eq!(svc.sync_queue_len(), 0);
    }

    #[tokio::test]
    async fn test_validation_allows_long_ids_up_to_255() {
        let (svc, _, _) = service();
        let id = "x".repeat(255);
        svc.write("t", Operation::Insert, &id, json!({})).await.unwrap();

        let too_long = "x".repeat(256);
        assert!(svc
            .write("t", Operation::Insert, &too_long, json!({}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_local_write_failure_surfaces() {
        let (svc, local, _) = service();
        local.set_failing(true);

        let result = svc.write("t", Operation::Insert, "a", json!({})).await;
        assert!(matches!(result, Err(SyncError::Write(_))));
        assert_eq!(svc.sync_queue_len(), 0, "failed write is not queued");
    }

    #[tokio::test]
    async fn test_state_machine_through_lifecycle() {
        let (svc, _, _) = service();
        assert_eq!(svc.state(), ServiceState::Created);

        svc.initialize_advanced_features();
        assert_eq!(svc.state(), ServiceState::Running);

        svc.shutdown().await;
        assert_eq!(svc.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (svc, _, _) = service();
        svc.initialize_advanced_features();

        svc.shutdown().await;
        svc.shutdown().await;

        assert_eq!(svc.state(), ServiceState::Stopped);
        assert_eq!(
            svc.connection_status(),
            ConnectionStatus::disconnected()
        );
    }

    #[tokio::test]
    async fn test_stopped_service_rejects_calls() {
        let (svc, _, _) = service();
        svc.shutdown().await;

        assert!(matches!(
            svc.read("t", "a").await,
            Err(SyncError::NotRunning)
        ));
        assert!(matches!(
            svc.write("t", Operation::Insert, "a", json!({})).await,
            Err(SyncError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_initialize_advanced_features_idempotent() {
        let (svc, _, _) = service();
        svc.initialize_advanced_features();
        svc.initialize_advanced_features();

        assert_eq!(svc.state(), ServiceState::Running);
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let (svc, _, remote) = service();
        for i in 0..5 {
            svc.write("t", Operation::Insert, &format!("id-{}", i), json!({}))
                .await
                .unwrap();
        }
        assert_eq!(svc.sync_queue_len(), 5);

        svc.shutdown().await;

        assert_eq!(svc.sync_queue_len(), 0);
        assert_eq!(remote.len(), 5);
    }

    #[tokio::test]
    async fn test_cache_config_round_trip_via_facade() {
        let (svc, _, _) = service();
        let cfg = CacheConfig {
            max_memory_bytes: 1234,
            max_entries: 5,
            ttl_secs: 10,
            gc_interval_secs: 2,
        };
        svc.set_cache_config(cfg.clone());
        assert_eq!(svc.cache_config(), cfg);
    }

    #[tokio::test]
    async fn test_state_subscription_sees_transitions() {
        let (svc, _, _) = service();
        let mut rx = svc.subscribe_state();

        svc.initialize_advanced_features();
        rx.changed().await.unwrap();
        // May observe Initializing or Running depending on timing
        assert_ne!(*rx.borrow_and_update(), ServiceState::Created);

        svc.shutdown().await;
        assert_eq!(*svc.subscribe_state().borrow(), ServiceState::Stopped);
    }

    #[test]
    fn test_validate_write_delete_ignores_fields() {
        assert!(validate_write("t", "id", Operation::Delete, &Value::Null).is_ok());
    }
}
