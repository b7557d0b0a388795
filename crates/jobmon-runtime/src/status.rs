use std::path::PathBuf;

use anyhow::{Context, Result};
use jobmon_store::{JobRecord, JobStore, LifecycleState};
use serde::Serialize;

use crate::process::ProcessControl;

const ERROR_PATH_DISPLAY_CHARS: usize = 32;

/// One line of `jobmon status`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobStatusRow {
    pub job_id: String,
    pub lifecycle_state: LifecycleState,
    pub monitor_pid: Option<u32>,
    pub monitor_alive: bool,
    pub final_state: Option<String>,
    pub error_log_path: PathBuf,
    pub reason_code: String,
    pub notified: bool,
    pub cancelled: bool,
}

impl JobStatusRow {
    pub fn from_record(record: &JobRecord, processes: &dyn ProcessControl) -> Self {
        let monitor_alive = record
            .monitor_pid
            .is_some_and(|pid| processes.is_alive(pid));
        Self {
            job_id: record.job_id.clone(),
            lifecycle_state: record.lifecycle_state,
            monitor_pid: record.monitor_pid,
            monitor_alive,
            final_state: record.final_state.clone(),
            error_log_path: record.error_log_path.clone(),
            reason_code: record.reason_code.clone(),
            notified: record.notified,
            cancelled: record.cancelled,
        }
    }

    /// `alive`, `done` for finished records, `DEAD` when a monitor is missing.
    pub fn monitor_label(&self) -> &'static str {
        if self.monitor_alive {
            "alive"
        } else if self.lifecycle_state == LifecycleState::Complete {
            "done"
        } else if self.cancelled {
            "cancelled"
        } else {
            "DEAD"
        }
    }
}

/// Status rows for every tracked job, sorted by job id.
pub fn job_status(store: &JobStore, processes: &dyn ProcessControl) -> Result<Vec<JobStatusRow>> {
    let records = store.list().context("failed to list job records")?;
    Ok(records
        .iter()
        .map(|record| JobStatusRow::from_record(record, processes))
        .collect())
}

pub fn render_status_table(rows: &[JobStatusRow]) -> String {
    if rows.is_empty() {
        return "no monitored jobs\n".to_string();
    }
    let mut out = format!(
        "{:<12} {:<12} {:<10} {:<16} {}\n",
        "Job ID", "Status", "Monitor", "Final State", "Error File"
    );
    out.push_str(&"-".repeat(80));
    out.push('\n');
    for row in rows {
        out.push_str(&format!(
            "{:<12} {:<12} {:<10} {:<16} {}\n",
            row.job_id,
            row.lifecycle_state.as_str(),
            row.monitor_label(),
            row.final_state.as_deref().unwrap_or("-"),
            shorten_path(&row.error_log_path.display().to_string()),
        ));
    }
    out
}

fn shorten_path(path: &str) -> String {
    let count = path.chars().count();
    if count <= ERROR_PATH_DISPLAY_CHARS + 3 {
        return path.to_string();
    }
    let tail = path
        .chars()
        .skip(count - ERROR_PATH_DISPLAY_CHARS)
        .collect::<String>();
    format!("...{tail}")
}
