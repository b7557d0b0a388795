//! Query adapter over the cluster scheduler.
//!
//! The monitor only sees [`SchedulerClient`]; [`SlurmCli`] shells out to the
//! SLURM command line tools and hides their formatting quirks.

use async_trait::async_trait;
use thiserror::Error;

mod accounting;
mod slurm;

pub use accounting::{parse_exit_code, parse_memory_bytes, AccountingRecord};
pub use slurm::{
    parse_sacct_output, parse_squeue_output, parse_submitted_job_id, SlurmCli, SlurmCliConfig,
};

/// Where the job currently sits in the live queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveState {
    /// The live queue no longer knows the job.
    Absent,
    Pending,
    Running,
    /// Any other live queue state (`COMPLETING`, `SUSPENDED`, ...).
    Other(String),
}

impl LiveState {
    pub fn from_queue_state(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "" => Self::Absent,
            "PENDING" => Self::Pending,
            "RUNNING" => Self::Running,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Absent)
    }
}

/// Errors returned by scheduler queries.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{program}' timed out after {timeout_ms}ms")]
    Timeout { program: String, timeout_ms: u64 },
    #[error("'{program}' failed with status {status}: {detail}")]
    CommandFailed {
        program: String,
        status: String,
        detail: String,
    },
    #[error("unexpected output from '{program}': {detail}")]
    UnexpectedOutput { program: String, detail: String },
}

/// Live queue and accounting lookups for one job id.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Current live queue state of the job.
    async fn live_state(&self, job_id: &str) -> Result<LiveState, SchedulerError>;

    /// Final accounting record, or `None` while accounting has not caught up.
    async fn final_accounting(
        &self,
        job_id: &str,
    ) -> Result<Option<AccountingRecord>, SchedulerError>;
}
