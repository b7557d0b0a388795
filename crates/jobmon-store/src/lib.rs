//! Durable per-job records for the jobmon monitor.
//!
//! One JSON manifest per scheduler job id lives under `<state_dir>/jobs/`.
//! Every write replaces the whole manifest atomically, so the monitor daemon,
//! `jobmon status` and `jobmon recover` can read concurrently without ever
//! observing a partial record.

use std::path::PathBuf;

use thiserror::Error;

mod lock;
mod record;
mod store;

pub use record::{FinalAccounting, JobRecord, LifecycleState, JOB_RECORD_SCHEMA_VERSION};
pub use store::{validate_job_id, JobStore, NewJobRecord, TransitionEvent};

/// Result type for state store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by the state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a monitor is already registered for job '{0}'")]
    DuplicateMonitor(String),
    #[error("job '{0}' is not tracked")]
    NotFound(String),
    #[error("invalid job id '{0}': expected ASCII letters, digits, '_', '.' or '-'")]
    InvalidJobId(String),
    #[error("invalid lifecycle transition for job '{job_id}': {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: LifecycleState,
        to: LifecycleState,
    },
    #[error("job '{0}' has already been notified")]
    AlreadyNotified(String),
    #[error("job '{0}' was cancelled and cannot be revived")]
    Cancelled(String),
    #[error("timed out waiting for record lock {}", .0.display())]
    LockTimeout(PathBuf),
    #[error("failed to parse job record {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to persist job record {}: {detail}", .path.display())]
    Persist { path: PathBuf, detail: String },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
