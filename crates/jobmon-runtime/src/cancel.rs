use anyhow::{bail, Context, Result};
use jobmon_store::{JobRecord, JobStore, LifecycleState};

use crate::process::ProcessControl;

pub const REASON_MONITOR_CANCELLED: &str = "monitor_cancelled";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub record: JobRecord,
    /// True when a live monitor process received SIGTERM.
    pub signalled: bool,
}

/// Stops monitoring `job_id`. The scheduler job itself is left alone.
///
/// The record is diverted to `dead` with `cancelled` set, which keeps recovery
/// away from it for good.
pub fn cancel_monitor(
    store: &JobStore,
    processes: &dyn ProcessControl,
    job_id: &str,
) -> Result<CancelOutcome> {
    let record = store
        .load(job_id)?
        .with_context(|| format!("job {job_id} is not tracked"))?;
    if record.notified || record.lifecycle_state == LifecycleState::Complete {
        bail!("job {job_id} already finished monitoring; nothing to cancel");
    }

    let signalled = match record.monitor_pid {
        Some(pid) if processes.is_alive(pid) => processes.terminate(pid)?,
        Some(pid) => {
            tracing::info!(job_id, pid, "monitor process already gone");
            false
        }
        None => false,
    };

    let record = store.update(job_id, |record| {
        record.divert_to_dead(REASON_MONITOR_CANCELLED);
        record.cancelled = true;
        Ok(())
    })?;
    tracing::info!(job_id, signalled, "monitor cancelled");
    Ok(CancelOutcome { record, signalled })
}
