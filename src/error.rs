//! Facade-level error taxonomy.
//!
//! Only failures with no fallback path reach the caller: validation of a
//! write before anything is committed, local store failures (there is no
//! secondary read path), and calls against a stopped service. Remote
//! propagation failures never surface here; the local write already
//! succeeded, so they are isolated into retry/dead-letter handling and
//! reported through stats.

use thiserror::Error;
use crate::storage::traits::StorageError;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed table name, record ID, or field payload. Raised before
    /// any commit is attempted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The local store could not serve a read.
    #[error("local read failed: {0}")]
    Read(#[source] StorageError),

    /// The local store rejected the synchronous commit of a write.
    #[error("local write failed: {0}")]
    Write(#[source] StorageError),

    /// A backend could not be reached during service construction.
    #[error("backend connection failed: {0}")]
    Connection(String),

    /// The service has been shut down (or is shutting down).
    #[error("service is not running")]
    NotRunning,
}
