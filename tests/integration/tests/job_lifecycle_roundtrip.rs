use std::{
    collections::{HashSet, VecDeque},
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Result};
use httpmock::prelude::*;
use jobmon_classifier::{default_pattern_rules, RuleSet};
use jobmon_notify::{NotifyConfig, WebhookNotifier};
use jobmon_runtime::{
    recover, register_and_launch, resolve_watch_log_paths, run_monitor, MonitorContext,
    MonitorExit, MonitorLauncher, MonitorTimings, ProcessControl, RecoveryAction,
};
use jobmon_scheduler::{SlurmCli, SlurmCliConfig};
use jobmon_store::{JobStore, LifecycleState};

static WORKSPACE_COUNTER: AtomicU64 = AtomicU64::new(1);

struct IsolatedWorkspace {
    root: PathBuf,
}

impl IsolatedWorkspace {
    fn new(label: &str) -> Self {
        let tick = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        let count = WORKSPACE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "jobmon-{label}-{}-{tick}-{count}",
            std::process::id()
        ));
        fs::create_dir_all(&root).expect("must create isolated workspace root");
        Self { root }
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for IsolatedWorkspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

/// Hands out pids from a script and never starts a process.
struct RecordingLauncher {
    pids: Mutex<VecDeque<u32>>,
    launched: Mutex<Vec<String>>,
}

impl RecordingLauncher {
    fn new(pids: &[u32]) -> Self {
        Self {
            pids: Mutex::new(pids.iter().copied().collect()),
            launched: Mutex::new(Vec::new()),
        }
    }

    fn launched(&self) -> Vec<String> {
        self.launched.lock().expect("launcher lock").clone()
    }
}

impl MonitorLauncher for RecordingLauncher {
    fn launch(&self, job_id: &str) -> Result<u32> {
        self.launched
            .lock()
            .expect("launcher lock")
            .push(job_id.to_string());
        self.pids
            .lock()
            .expect("launcher lock")
            .pop_front()
            .ok_or_else(|| anyhow!("no pid scripted for {job_id}"))
    }
}

#[derive(Default)]
struct StaticProcesses {
    alive: HashSet<u32>,
}

impl ProcessControl for StaticProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.contains(&pid)
    }

    fn terminate(&self, _pid: u32) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(unix)]
fn write_script(dir: &Path, name: &str, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let script = dir.join(name);
    fs::write(&script, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut perms = fs::metadata(&script)
        .expect("script metadata")
        .permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script, perms).expect("chmod script");
    script.display().to_string()
}

/// squeue reports RUNNING once, then forgets the job; sacct reports `state`.
#[cfg(unix)]
fn fake_slurm(dir: &Path, job_id: &str, state: &str, exit_code: &str) -> SlurmCli {
    let marker = dir.join("squeue-seen");
    let squeue = write_script(
        dir,
        "squeue",
        &format!(
            "if [ -f '{marker}' ]; then exit 0; fi\ntouch '{marker}'\necho RUNNING",
            marker = marker.display()
        ),
    );
    let sacct = write_script(
        dir,
        "sacct",
        &format!(
            "echo '{job_id}|{state}|{exit_code}|00:12:34||train'\necho '{job_id}.batch|{state}|{exit_code}|00:12:34|2048K|batch'"
        ),
    );
    SlurmCli::new(SlurmCliConfig {
        squeue,
        sacct,
        sbatch: "false".to_string(),
        command_timeout_ms: 5_000,
    })
}

fn instant_timings() -> MonitorTimings {
    MonitorTimings {
        pending_poll: Duration::ZERO,
        running_poll: Duration::ZERO,
        accounting_retry: Duration::ZERO,
        accounting_attempts: 3,
        log_flush: Duration::ZERO,
    }
}

fn webhook_notifier(server: &MockServer) -> WebhookNotifier {
    WebhookNotifier::new(NotifyConfig {
        success_webhook: server.url("/success"),
        error_webhook: server.url("/error"),
        timeout_ms: 5_000,
        max_attempts: 2,
        backoff_base_ms: 1,
    })
    .expect("webhook notifier")
}

#[cfg(unix)]
#[tokio::test]
async fn integration_failed_job_is_classified_notified_once_and_left_alone_by_recovery() {
    let workspace = IsolatedWorkspace::new("failed-job");
    let store = JobStore::open(workspace.root().join("state")).expect("store");
    let slurm = fake_slurm(workspace.root(), "4242", "FAILED", "1:0");
    let server = MockServer::start();
    let error_hook = server.mock(|when, then| {
        when.method(POST)
            .path("/error")
            .body_includes("Python Traceback")
            .body_includes("CUDA Out of Memory");
        then.status(204);
    });
    let success_hook = server.mock(|when, then| {
        when.method(POST).path("/success");
        then.status(204);
    });
    let notifier = webhook_notifier(&server);
    let rules = RuleSet::compile(&default_pattern_rules()).expect("rules");
    let timings = instant_timings();
    let ctx = MonitorContext {
        store: &store,
        scheduler: &slurm,
        notifier: &notifier,
        rules: &rules,
        timings: &timings,
    };

    let paths = resolve_watch_log_paths(
        "4242",
        Some(Path::new("train-4242.err")),
        None,
        workspace.root(),
    );
    fs::write(
        &paths.error,
        "step 10\nTraceback (most recent call last):\n  File \"train.py\", line 3\ntorch.cuda.OutOfMemoryError: CUDA out of memory.\n",
    )
    .expect("error log");
    let launcher = RecordingLauncher::new(&[7001]);
    let registered = register_and_launch(&store, &launcher, "4242", paths).expect("register");
    assert_eq!(registered.monitor_pid, Some(7001));

    let exit = run_monitor(&ctx, "4242", 7001).await.expect("monitor");
    assert!(matches!(exit, MonitorExit::Finalized(ref outcome) if outcome.delivered));
    error_hook.assert_calls(1);
    success_hook.assert_calls(0);

    let record = store.load("4242").expect("load").expect("record");
    assert_eq!(record.lifecycle_state, LifecycleState::Complete);
    assert_eq!(record.final_state.as_deref(), Some("FAILED"));
    assert_eq!(record.exit_code, Some(1));
    assert_eq!(record.peak_memory.as_deref(), Some("2048K"));
    assert_eq!(
        record.matched_patterns,
        vec!["Python Traceback", "CUDA Out of Memory"]
    );

    for _ in 0..2 {
        let report = recover(&ctx, &launcher, &StaticProcesses::default())
            .await
            .expect("recover");
        assert_eq!(report.summary.untouched, 1);
        assert_eq!(report.summary.finalized + report.summary.restarted, 0);
    }
    error_hook.assert_calls(1);
    assert_eq!(launcher.launched(), vec!["4242"]);
}

#[cfg(unix)]
#[tokio::test]
async fn integration_crashed_monitor_is_finalized_by_recovery_without_a_second_record() {
    let workspace = IsolatedWorkspace::new("crashed-monitor");
    let store = JobStore::open(workspace.root().join("state")).expect("store");
    let slurm = fake_slurm(workspace.root(), "5150", "COMPLETED", "0:0");
    let server = MockServer::start();
    let success_hook = server.mock(|when, then| {
        when.method(POST).path("/success").body_includes("5150");
        then.status(204);
    });
    let notifier = webhook_notifier(&server);
    let rules = RuleSet::compile(&default_pattern_rules()).expect("rules");
    let timings = instant_timings();
    let ctx = MonitorContext {
        store: &store,
        scheduler: &slurm,
        notifier: &notifier,
        rules: &rules,
        timings: &timings,
    };

    let launcher = RecordingLauncher::new(&[8001, 8002]);
    let paths = resolve_watch_log_paths("5150", None, None, workspace.root());
    register_and_launch(&store, &launcher, "5150", paths).expect("register");

    // The job is still running and monitor 8001 is gone: recovery relaunches.
    let first = recover(&ctx, &launcher, &StaticProcesses::default())
        .await
        .expect("first recovery");
    assert_eq!(first.summary.restarted, 1);
    assert_eq!(
        first.jobs[0].action,
        RecoveryAction::Restarted {
            monitor_pid: Some(8002)
        }
    );

    // That monitor dies too; by now the job has left the queue.
    let second = recover(&ctx, &launcher, &StaticProcesses::default())
        .await
        .expect("second recovery");
    assert_eq!(second.summary.finalized, 1);
    success_hook.assert_calls(1);

    let third = recover(&ctx, &launcher, &StaticProcesses::default())
        .await
        .expect("third recovery");
    assert_eq!(third.summary.untouched, 1);
    success_hook.assert_calls(1);

    let records = store.list().expect("list");
    assert_eq!(records.len(), 1);
    assert!(records[0].notified);
    assert_eq!(records[0].notification_delivered, Some(true));
    assert_eq!(launcher.launched(), vec!["5150", "5150"]);

    let journal = fs::read_to_string(store.journal_path()).expect("journal");
    let last = journal.lines().last().expect("journal line");
    let event: serde_json::Value = serde_json::from_str(last).expect("json");
    assert_eq!(event["to"], "complete");
}
