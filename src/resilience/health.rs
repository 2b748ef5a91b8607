//! Backend health tracking for the two stores.
//!
//! A backend is marked unhealthy after three consecutive failures and
//! healthy again on the first success. The periodic monitor drives
//! [`BackendHealth::check`]; the push/pull paths feed in their own
//! outcomes so health reflects real traffic, not just probes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::storage::RecordStore;

/// Consecutive failures before a backend is marked unhealthy.
const UNHEALTHY_THRESHOLD: u64 = 3;

/// Connectivity snapshot for both stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub local: bool,
    pub remote: bool,
}

impl ConnectionStatus {
    /// Status reported when the service is not running.
    #[must_use]
    pub fn disconnected() -> Self {
        Self {
            local: false,
            remote: false,
        }
    }
}

/// Tracks one backend's health from observed operation outcomes.
pub struct BackendHealth {
    name: &'static str,
    healthy: AtomicBool,
    consecutive_failures: AtomicU64,
    /// Serializes active probes so overlapping ticks don't double-ping
    checking: Mutex<()>,
}

impl BackendHealth {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU64::new(0),
            checking: Mutex::new(()),
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        if !self.healthy.swap(true, Ordering::AcqRel) {
            info!(backend = self.name, "Backend recovered");
            crate::metrics::set_backend_healthy(self.name, true);
        }
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        crate::metrics::record_connection_error(self.name);
        if failures >= UNHEALTHY_THRESHOLD && self.healthy.swap(false, Ordering::AcqRel) {
            warn!(
                backend = self.name,
                failures, "Backend marked unhealthy"
            );
            crate::metrics::set_backend_healthy(self.name, false);
        }
    }

    /// Force-unhealthy, used at shutdown.
    pub fn mark_down(&self) {
        self.healthy.store(false, Ordering::Release);
        crate::metrics::set_backend_healthy(self.name, false);
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Active probe: ping the store and fold the outcome into the health
    /// state. Returns the probe result.
    pub async fn check(&self, store: &dyn RecordStore) -> bool {
        let _guard = self.checking.lock().await;
        match store.ping().await {
            Ok(()) => {
                self.record_success();
                true
            }
            Err(_) => {
                self.record_failure();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn test_starts_healthy() {
        let health = BackendHealth::new("remote");
        assert!(health.is_healthy());
        assert_eq!(health.failure_count(), 0);
    }

    #[test]
    fn test_unhealthy_after_three_consecutive_failures() {
        let health = BackendHealth::new("remote");
        health.record_failure();
        health.record_failure();
        assert!(health.is_healthy(), "two failures is not enough");

        health.record_failure();
        assert!(!health.is_healthy());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let health = BackendHealth::new("remote");
        health.record_failure();
        health.record_failure();
        health.record_success();
        health.record_failure();
        health.record_failure();

        assert!(health.is_healthy());
        assert_eq!(health.failure_count(), 2);
    }

    #[test]
    fn test_recovery_on_first_success() {
        let health = BackendHealth::new("remote");
        for _ in 0..5 {
            health.record_failure();
        }
        assert!(!health.is_healthy());

        health.record_success();
        assert!(health.is_healthy());
    }

    #[test]
    fn test_mark_down() {
        let health = BackendHealth::new("local");
        health.mark_down();
        assert!(!health.is_healthy());
    }

    #[tokio::test]
    async fn test_check_probes_store() {
        let health = BackendHealth::new("remote");
        let store = MemoryStore::new();

        assert!(health.check(&store).await);

        store.set_failing(true);
        for _ in 0..3 {
            assert!(!health.check(&store).await);
        }
        assert!(!health.is_healthy());

        store.set_failing(false);
        assert!(health.check(&store).await);
        assert!(health.is_healthy());
    }

    #[test]
    fn test_connection_status_serializes() {
        let status = ConnectionStatus {
            local: true,
            remote: false,
        };
        let json = serde_json::to_value(status).unwrap();
        assert_eq!(json["local"], true);
        assert_eq!(json["remote"], false);
    }
}
