use std::path::{Path, PathBuf};
use std::time::Duration;

use jobmon_core::{
    append_jsonl_with_rotation, current_unix_timestamp_ms, read_text_if_exists, write_text_atomic,
    JournalRotationPolicy,
};
use serde::{Deserialize, Serialize};

use crate::lock::RecordLock;
use crate::record::{JobRecord, LifecycleState, JOB_RECORD_SCHEMA_VERSION};
use crate::{StoreError, StoreResult};

const JOBS_DIR: &str = "jobs";
const LOGS_DIR: &str = "logs";
const JOURNAL_FILE: &str = "events.jsonl";
const RECORD_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const REASON_MONITOR_REGISTERED: &str = "monitor_registered";

/// Input for registering a new monitored job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJobRecord {
    pub job_id: String,
    pub error_log_path: PathBuf,
    pub output_log_path: PathBuf,
}

/// One line of the append-only transition journal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransitionEvent {
    pub timestamp_unix_ms: u64,
    pub job_id: String,
    pub from: Option<LifecycleState>,
    pub to: LifecycleState,
    pub reason_code: String,
    pub monitor_pid: Option<u32>,
    pub notified: bool,
}

/// File-backed store holding one JSON manifest per job id.
#[derive(Debug, Clone)]
pub struct JobStore {
    state_dir: PathBuf,
    journal_policy: JournalRotationPolicy,
}

impl JobStore {
    /// Opens (creating if needed) the store layout under `state_dir`.
    pub fn open(state_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let store = Self {
            state_dir: state_dir.into(),
            journal_policy: JournalRotationPolicy::from_env(),
        };
        std::fs::create_dir_all(store.jobs_dir())?;
        std::fs::create_dir_all(store.logs_dir())?;
        Ok(store)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.state_dir.join(JOBS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join(LOGS_DIR)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.state_dir.join(JOURNAL_FILE)
    }

    /// Deterministic diagnostic log path for the monitor daemon of `job_id`.
    pub fn monitor_log_path(&self, job_id: &str) -> PathBuf {
        self.logs_dir().join(format!("{job_id}.monitor.log"))
    }

    pub fn record_path(&self, job_id: &str) -> PathBuf {
        self.jobs_dir().join(format!("{job_id}.json"))
    }

    fn lock_path(&self, job_id: &str) -> PathBuf {
        self.jobs_dir().join(format!("{job_id}.json.lock"))
    }

    /// Registers a job. A second registration for the same id is rejected and
    /// leaves the first record untouched.
    pub fn create(&self, request: NewJobRecord) -> StoreResult<JobRecord> {
        validate_job_id(&request.job_id)?;
        let _lock = RecordLock::acquire(self.lock_path(&request.job_id), RECORD_LOCK_TIMEOUT)?;
        let path = self.record_path(&request.job_id);
        if path.exists() {
            return Err(StoreError::DuplicateMonitor(request.job_id));
        }

        let now = current_unix_timestamp_ms();
        let record = JobRecord {
            schema_version: JOB_RECORD_SCHEMA_VERSION,
            job_id: request.job_id,
            lifecycle_state: LifecycleState::Pending,
            reason_code: REASON_MONITOR_REGISTERED.to_string(),
            error_log_path: request.error_log_path,
            output_log_path: request.output_log_path,
            monitor_pid: None,
            created_unix_ms: now,
            updated_unix_ms: now,
            final_state: None,
            exit_code: None,
            exit_signal: None,
            wall_time: None,
            peak_memory: None,
            job_name: None,
            accounting_indeterminate: false,
            matched_patterns: Vec::new(),
            notified: false,
            notification_delivered: None,
            resume_state: None,
            cancelled: false,
        };
        self.persist(&record)?;
        self.journal(None, &record);
        Ok(record)
    }

    /// Loads one record, or `None` when the job is not tracked.
    pub fn load(&self, job_id: &str) -> StoreResult<Option<JobRecord>> {
        validate_job_id(job_id)?;
        read_record(&self.record_path(job_id))
    }

    /// Atomically reads, mutates and replaces one record.
    ///
    /// When `mutate` fails nothing is written and the error is returned.
    pub fn update<F>(&self, job_id: &str, mutate: F) -> StoreResult<JobRecord>
    where
        F: FnOnce(&mut JobRecord) -> StoreResult<()>,
    {
        validate_job_id(job_id)?;
        let _lock = RecordLock::acquire(self.lock_path(job_id), RECORD_LOCK_TIMEOUT)?;
        let path = self.record_path(job_id);
        let mut record =
            read_record(&path)?.ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        let before = record.clone();

        mutate(&mut record)?;
        if record == before {
            return Ok(record);
        }
        record.job_id = before.job_id.clone();
        record.error_log_path = before.error_log_path.clone();
        record.output_log_path = before.output_log_path.clone();
        record.created_unix_ms = before.created_unix_ms;
        record.updated_unix_ms = current_unix_timestamp_ms().max(before.updated_unix_ms);
        self.persist(&record)?;

        if record.lifecycle_state != before.lifecycle_state
            || record.reason_code != before.reason_code
        {
            self.journal(Some(before.lifecycle_state), &record);
        }
        Ok(record)
    }

    /// Returns every readable record, ordered by job id.
    pub fn list(&self) -> StoreResult<Vec<JobRecord>> {
        let dir = self.jobs_dir();
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let is_record = path.is_file()
                && path
                    .extension()
                    .and_then(|value| value.to_str())
                    .is_some_and(|value| value.eq_ignore_ascii_case("json"));
            if is_record {
                paths.push(path);
            }
        }
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            match read_record(&path) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "skipping unreadable job record");
                }
            }
        }
        records.sort_by(|left, right| left.job_id.cmp(&right.job_id));
        Ok(records)
    }

    fn persist(&self, record: &JobRecord) -> StoreResult<()> {
        let path = self.record_path(&record.job_id);
        let mut payload = serde_json::to_string_pretty(record)?;
        payload.push('\n');
        write_text_atomic(&path, &payload).map_err(|error| StoreError::Persist {
            path,
            detail: format!("{error:#}"),
        })
    }

    fn journal(&self, from: Option<LifecycleState>, record: &JobRecord) {
        let event = TransitionEvent {
            timestamp_unix_ms: record.updated_unix_ms,
            job_id: record.job_id.clone(),
            from,
            to: record.lifecycle_state,
            reason_code: record.reason_code.clone(),
            monitor_pid: record.monitor_pid,
            notified: record.notified,
        };
        let path = self.journal_path();
        if let Err(error) = append_jsonl_with_rotation(&path, &event, self.journal_policy) {
            tracing::warn!(
                job_id = %record.job_id,
                path = %path.display(),
                error = %format!("{error:#}"),
                "failed to append transition journal"
            );
        }
    }
}

/// Rejects ids that are empty or could escape the jobs directory.
pub fn validate_job_id(job_id: &str) -> StoreResult<()> {
    let valid = !job_id.is_empty()
        && job_id.len() <= 128
        && !job_id.starts_with('.')
        && job_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidJobId(job_id.to_string()))
    }
}

fn read_record(path: &Path) -> StoreResult<Option<JobRecord>> {
    let Some(raw) = read_text_if_exists(path).map_err(|error| StoreError::Persist {
        path: path.to_path_buf(),
        detail: format!("{error:#}"),
    })?
    else {
        return Ok(None);
    };
    serde_json::from_str::<JobRecord>(&raw)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}
