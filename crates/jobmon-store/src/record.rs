use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{StoreError, StoreResult};

pub const JOB_RECORD_SCHEMA_VERSION: u32 = 1;

fn job_record_schema_version() -> u32 {
    JOB_RECORD_SCHEMA_VERSION
}

/// Monitor-side lifecycle of one tracked job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Job is queued at the scheduler and has not started.
    Pending,
    /// Job is executing.
    Running,
    /// Job left the live queue; accounting, classification and notification pending.
    Finalizing,
    /// Outcome notified. Terminal.
    Complete,
    /// Monitor is gone without reaching `complete`, or tracking was cancelled.
    Dead,
}

impl LifecycleState {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Finalizing => "finalizing",
            Self::Complete => "complete",
            Self::Dead => "dead",
        }
    }

    /// Returns true for states a live monitor owns.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Finalizing)
    }

    fn forward_rank(self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Running => Some(1),
            Self::Finalizing => Some(2),
            Self::Complete => Some(3),
            Self::Dead => None,
        }
    }

    /// Returns true when a monitor may move from `self` to `next` without recovery.
    ///
    /// Staying in place is allowed. Any non-terminal state may divert to `dead`.
    pub fn can_advance_to(self, next: LifecycleState) -> bool {
        if self == next {
            return true;
        }
        if next == Self::Dead {
            return self != Self::Complete;
        }
        match (self.forward_rank(), next.forward_rank()) {
            (Some(from), Some(to)) => to > from,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final accounting values copied into a record once the scheduler reports them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalAccounting {
    pub final_state: String,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub wall_time: Option<String>,
    pub peak_memory: Option<String>,
    pub job_name: Option<String>,
}

/// Durable manifest persisted for each monitored job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    #[serde(default = "job_record_schema_version")]
    pub schema_version: u32,
    pub job_id: String,
    pub lifecycle_state: LifecycleState,
    #[serde(default)]
    pub reason_code: String,
    pub error_log_path: PathBuf,
    pub output_log_path: PathBuf,
    #[serde(default)]
    pub monitor_pid: Option<u32>,
    pub created_unix_ms: u64,
    pub updated_unix_ms: u64,
    #[serde(default)]
    pub final_state: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub exit_signal: Option<i32>,
    #[serde(default)]
    pub wall_time: Option<String>,
    #[serde(default)]
    pub peak_memory: Option<String>,
    #[serde(default)]
    pub job_name: Option<String>,
    #[serde(default)]
    pub accounting_indeterminate: bool,
    #[serde(default)]
    pub matched_patterns: Vec<String>,
    #[serde(default)]
    pub notified: bool,
    #[serde(default)]
    pub notification_delivered: Option<bool>,
    #[serde(default)]
    pub resume_state: Option<LifecycleState>,
    #[serde(default)]
    pub cancelled: bool,
}

impl JobRecord {
    /// Moves the record forward (or keeps it in place) under monitor ownership.
    pub fn advance_to(&mut self, next: LifecycleState, reason_code: &str) -> StoreResult<()> {
        if !self.lifecycle_state.can_advance_to(next) {
            return Err(StoreError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.lifecycle_state,
                to: next,
            });
        }
        if next == LifecycleState::Dead {
            self.divert_to_dead(reason_code);
            return Ok(());
        }
        self.lifecycle_state = next;
        self.reason_code = reason_code.to_string();
        Ok(())
    }

    /// Diverts a non-terminal record to `dead`, remembering where it was.
    pub fn divert_to_dead(&mut self, reason_code: &str) {
        if self.lifecycle_state == LifecycleState::Complete {
            return;
        }
        if self.lifecycle_state.is_active() {
            self.resume_state = Some(self.lifecycle_state);
        }
        self.lifecycle_state = LifecycleState::Dead;
        self.reason_code = reason_code.to_string();
    }

    /// Brings a `dead` record back under explicit recovery.
    ///
    /// Only `running` and `finalizing` are valid targets, and cancelled or
    /// already-notified records stay dead.
    pub fn revive(&mut self, next: LifecycleState, reason_code: &str) -> StoreResult<()> {
        if self.cancelled {
            return Err(StoreError::Cancelled(self.job_id.clone()));
        }
        if self.notified {
            return Err(StoreError::AlreadyNotified(self.job_id.clone()));
        }
        if self.lifecycle_state != LifecycleState::Dead
            || !matches!(next, LifecycleState::Running | LifecycleState::Finalizing)
        {
            return Err(StoreError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.lifecycle_state,
                to: next,
            });
        }
        self.lifecycle_state = next;
        self.resume_state = None;
        self.reason_code = reason_code.to_string();
        Ok(())
    }

    /// Copies accounting values in once; later calls leave the first values intact.
    ///
    /// Returns true when the values were written.
    pub fn record_final_accounting(&mut self, accounting: &FinalAccounting) -> bool {
        if self.final_state.is_some() {
            return false;
        }
        self.final_state = Some(accounting.final_state.clone());
        self.exit_code = accounting.exit_code;
        self.exit_signal = accounting.exit_signal;
        self.wall_time = accounting.wall_time.clone();
        self.peak_memory = accounting.peak_memory.clone();
        self.job_name = accounting.job_name.clone();
        self.accounting_indeterminate = false;
        true
    }

    /// Stores classifier labels, keeping first-seen order and dropping repeats.
    pub fn record_matched_patterns<I, S>(&mut self, labels: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for label in labels {
            let label = label.into();
            if !self.matched_patterns.contains(&label) {
                self.matched_patterns.push(label);
            }
        }
    }

    /// Performs the single terminal write that marks the outcome as notified.
    pub fn mark_notified(&mut self, delivered: bool, reason_code: &str) -> StoreResult<()> {
        if self.notified {
            return Err(StoreError::AlreadyNotified(self.job_id.clone()));
        }
        if !self
            .lifecycle_state
            .can_advance_to(LifecycleState::Complete)
        {
            return Err(StoreError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.lifecycle_state,
                to: LifecycleState::Complete,
            });
        }
        self.notified = true;
        self.notification_delivered = Some(delivered);
        self.lifecycle_state = LifecycleState::Complete;
        self.reason_code = reason_code.to_string();
        Ok(())
    }

    /// Clean success from the persisted accounting: `COMPLETED`, exit code 0,
    /// no terminating signal.
    pub fn is_success(&self) -> bool {
        self.final_state.as_deref() == Some("COMPLETED")
            && self.exit_code == Some(0)
            && self.exit_signal.unwrap_or(0) == 0
    }

    /// Returns true when the recovery supervisor may act on this record.
    pub fn is_recoverable(&self) -> bool {
        if self.notified || self.cancelled {
            return false;
        }
        self.lifecycle_state.is_active() || self.lifecycle_state == LifecycleState::Dead
    }
}
