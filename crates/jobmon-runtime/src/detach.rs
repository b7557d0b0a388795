use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use jobmon_store::{JobRecord, JobStore, LifecycleState};

pub const REASON_MONITOR_LAUNCHED: &str = "monitor_launched";
pub const REASON_MONITOR_LAUNCH_FAILED: &str = "monitor_launch_failed";

/// Starts a monitor process bound to an existing record and returns its pid.
pub trait MonitorLauncher: Send + Sync {
    fn launch(&self, job_id: &str) -> Result<u32>;
}

/// Re-executes a `jobmon` binary as `jobmon monitor <job_id>` in a new session.
#[derive(Debug, Clone)]
pub struct DetachedLauncher {
    executable: PathBuf,
    state_dir: PathBuf,
    config_path: Option<PathBuf>,
    logs_dir: PathBuf,
}

impl DetachedLauncher {
    pub fn new(executable: PathBuf, store: &JobStore, config_path: Option<PathBuf>) -> Self {
        Self {
            executable,
            state_dir: store.state_dir().to_path_buf(),
            config_path,
            logs_dir: store.logs_dir(),
        }
    }

    /// Launcher for the binary that is currently running.
    pub fn for_current_exe(store: &JobStore, config_path: Option<PathBuf>) -> Result<Self> {
        let executable =
            std::env::current_exe().context("failed to resolve current jobmon executable")?;
        Ok(Self::new(executable, store, config_path))
    }

    fn monitor_log_path(&self, job_id: &str) -> PathBuf {
        self.logs_dir.join(format!("{job_id}.monitor.log"))
    }
}

impl MonitorLauncher for DetachedLauncher {
    fn launch(&self, job_id: &str) -> Result<u32> {
        let mut args: Vec<OsString> = vec![
            "--state-dir".into(),
            self.state_dir.clone().into_os_string(),
        ];
        if let Some(config_path) = &self.config_path {
            args.push("--config".into());
            args.push(config_path.clone().into_os_string());
        }
        args.push("monitor".into());
        args.push(job_id.into());
        spawn_detached(&self.executable, &args, &self.monitor_log_path(job_id))
    }
}

/// Spawns `program` in its own session with stdin from `/dev/null` and
/// stdout/stderr appended to `log_path`. The child is not waited on.
pub fn spawn_detached(program: &Path, args: &[OsString], log_path: &Path) -> Result<u32> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("failed to open monitor log {}", log_path.display()))?;
    let log_err = log
        .try_clone()
        .with_context(|| format!("failed to clone monitor log {}", log_path.display()))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    detach_session(&mut command);

    let child = command
        .spawn()
        .with_context(|| format!("failed to spawn detached monitor {}", program.display()))?;
    Ok(child.id())
}

#[cfg(unix)]
fn detach_session(command: &mut Command) {
    use std::os::unix::process::CommandExt;

    // SAFETY: setsid is async-signal-safe and touches no parent state.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid()
                .map(|_| ())
                .map_err(std::io::Error::from)
        });
    }
}

#[cfg(not(unix))]
fn detach_session(_command: &mut Command) {}

/// Launches a monitor for `job_id` and records its pid.
///
/// On a launch failure a `pending` record stays `pending` with no monitor pid;
/// a record that already ran diverts to `dead`. Recovery retries both.
pub fn launch_monitor(
    store: &JobStore,
    launcher: &dyn MonitorLauncher,
    job_id: &str,
) -> Result<JobRecord> {
    match launcher.launch(job_id) {
        Ok(pid) => {
            tracing::info!(job_id, pid, "monitor launched");
            store
                .update(job_id, |record| {
                    record.monitor_pid = Some(pid);
                    record.reason_code = REASON_MONITOR_LAUNCHED.to_string();
                    Ok(())
                })
                .with_context(|| format!("failed to record monitor pid for job {job_id}"))
        }
        Err(error) => {
            tracing::warn!(job_id, error = %format!("{error:#}"), "monitor launch failed");
            if let Err(store_error) = store.update(job_id, |record| {
                if record.lifecycle_state == LifecycleState::Pending {
                    record.monitor_pid = None;
                    record.reason_code = REASON_MONITOR_LAUNCH_FAILED.to_string();
                } else {
                    record.divert_to_dead(REASON_MONITOR_LAUNCH_FAILED);
                }
                Ok(())
            }) {
                tracing::warn!(job_id, error = %store_error, "failed to mark record dead");
            }
            Err(error.context(format!("failed to launch monitor for job {job_id}")))
        }
    }
}
