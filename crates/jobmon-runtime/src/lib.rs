//! Orchestration for the jobmon daemon: the per-job monitor state machine,
//! detached monitor launches, on-demand recovery and the operator actions
//! behind the `jobmon` CLI.

mod cancel;
mod config;
mod detach;
mod monitor;
mod process;
mod recovery;
mod status;
mod submit;

#[cfg(test)]
mod test_support;

pub use cancel::{cancel_monitor, CancelOutcome, REASON_MONITOR_CANCELLED};
pub use config::{
    load_config, JobmonConfig, TimingsConfig, CONFIG_SCHEMA_VERSION, ERROR_WEBHOOK_ENV,
    SUCCESS_WEBHOOK_ENV,
};
pub use detach::{
    launch_monitor, spawn_detached, DetachedLauncher, MonitorLauncher, REASON_MONITOR_LAUNCHED,
    REASON_MONITOR_LAUNCH_FAILED,
};
pub use monitor::{
    finalize_job, run_monitor, FinalizeOutcome, MonitorContext, MonitorExit, MonitorTimings,
};
pub use process::{is_process_alive, terminate_process, ProcessControl, SystemProcesses};
pub use recovery::{recover, RecoveredJob, RecoveryAction, RecoveryReport, RecoverySummary};
pub use status::{job_status, render_status_table, JobStatusRow};
pub use submit::{
    register_and_launch, resolve_submitted_log_paths, resolve_watch_log_paths, submit_and_monitor,
    substitute_job_id, LogPaths, SubmittedJob,
};
