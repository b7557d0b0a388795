//! On-demand recovery of records whose monitor is gone.

use anyhow::{Context, Result};
use jobmon_notify::Destination;
use jobmon_store::{JobRecord, LifecycleState};
use serde::Serialize;

use crate::detach::{launch_monitor, MonitorLauncher};
use crate::monitor::{finalize_job, MonitorContext};
use crate::process::ProcessControl;

pub const REASON_RECOVERED_LIVE: &str = "recovered_job_live";
pub const REASON_RECOVERED_LEFT_QUEUE: &str = "recovered_job_left_queue";

/// Counts of one recovery pass.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RecoverySummary {
    pub restarted: usize,
    pub finalized: usize,
    pub untouched: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    Untouched { reason: String },
    Restarted { monitor_pid: Option<u32> },
    Finalized { destination: Destination, delivered: bool },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RecoveredJob {
    pub job_id: String,
    #[serde(flatten)]
    pub action: RecoveryAction,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RecoveryReport {
    pub summary: RecoverySummary,
    pub jobs: Vec<RecoveredJob>,
}

impl RecoveryReport {
    fn push(&mut self, job_id: &str, action: RecoveryAction) {
        match &action {
            RecoveryAction::Untouched { .. } => self.summary.untouched += 1,
            RecoveryAction::Restarted { .. } => self.summary.restarted += 1,
            RecoveryAction::Finalized { .. } => self.summary.finalized += 1,
            RecoveryAction::Failed { .. } => self.summary.failed += 1,
        }
        self.jobs.push(RecoveredJob {
            job_id: job_id.to_string(),
            action,
        });
    }
}

/// Scans every record once: relaunches monitors for live jobs and finalizes
/// jobs that left the queue while nobody was watching.
///
/// Running the pass twice acts on nothing the first pass already settled.
pub async fn recover(
    ctx: &MonitorContext<'_>,
    launcher: &dyn MonitorLauncher,
    processes: &dyn ProcessControl,
) -> Result<RecoveryReport> {
    let records = ctx.store.list().context("failed to list job records")?;
    let mut report = RecoveryReport::default();
    for record in records {
        let action = recover_one(ctx, launcher, processes, &record).await;
        match &action {
            RecoveryAction::Untouched { .. } => {}
            RecoveryAction::Failed { error } => {
                tracing::warn!(job_id = %record.job_id, %error, "recovery failed");
            }
            other => tracing::info!(job_id = %record.job_id, action = ?other, "job recovered"),
        }
        report.push(&record.job_id, action);
    }
    tracing::info!(
        restarted = report.summary.restarted,
        finalized = report.summary.finalized,
        untouched = report.summary.untouched,
        failed = report.summary.failed,
        "recovery pass finished"
    );
    Ok(report)
}

async fn recover_one(
    ctx: &MonitorContext<'_>,
    launcher: &dyn MonitorLauncher,
    processes: &dyn ProcessControl,
    record: &JobRecord,
) -> RecoveryAction {
    if !record.is_recoverable() {
        return RecoveryAction::Untouched {
            reason: untouched_reason(record).to_string(),
        };
    }
    if record.lifecycle_state.is_active() {
        if let Some(pid) = record.monitor_pid.filter(|pid| processes.is_alive(*pid)) {
            return RecoveryAction::Untouched {
                reason: format!("monitor {pid} alive"),
            };
        }
    }

    let live = match ctx.scheduler.live_state(&record.job_id).await {
        Ok(live) => live,
        Err(error) => {
            return RecoveryAction::Failed {
                error: format!("live state query failed: {error}"),
            }
        }
    };

    let result = if live.is_live() {
        relaunch(ctx, launcher, record)
    } else {
        finalize_in_place(ctx, record).await
    };
    result.unwrap_or_else(|error| RecoveryAction::Failed {
        error: format!("{error:#}"),
    })
}

fn relaunch(
    ctx: &MonitorContext<'_>,
    launcher: &dyn MonitorLauncher,
    record: &JobRecord,
) -> Result<RecoveryAction> {
    if record.lifecycle_state == LifecycleState::Dead {
        ctx.store.update(&record.job_id, |record| {
            record.revive(LifecycleState::Running, REASON_RECOVERED_LIVE)
        })?;
    }
    let relaunched = launch_monitor(ctx.store, launcher, &record.job_id)?;
    Ok(RecoveryAction::Restarted {
        monitor_pid: relaunched.monitor_pid,
    })
}

async fn finalize_in_place(ctx: &MonitorContext<'_>, record: &JobRecord) -> Result<RecoveryAction> {
    ctx.store.update(&record.job_id, |record| {
        if record.lifecycle_state == LifecycleState::Dead {
            record.revive(LifecycleState::Finalizing, REASON_RECOVERED_LEFT_QUEUE)
        } else {
            record.advance_to(LifecycleState::Finalizing, REASON_RECOVERED_LEFT_QUEUE)
        }
    })?;
    let outcome = finalize_job(ctx, &record.job_id).await?;
    Ok(RecoveryAction::Finalized {
        destination: outcome.destination,
        delivered: outcome.delivered,
    })
}

fn untouched_reason(record: &JobRecord) -> &'static str {
    if record.cancelled {
        "cancelled"
    } else if record.notified {
        "already_notified"
    } else {
        "complete"
    }
}

#[cfg(test)]
mod tests {
    use jobmon_notify::Destination;
    use jobmon_scheduler::LiveState;
    use jobmon_store::{JobStore, LifecycleState};
    use tempfile::tempdir;

    use super::{recover, RecoveryAction};
    use crate::detach::launch_monitor;
    use crate::test_support::{
        accounting, context, instant_timings, register_job, traceback_rules, FakeLauncher,
        FakeProcesses, RecordingNotifier, ScriptedScheduler,
    };

    fn set_monitor(store: &JobStore, job_id: &str, pid: u32, state: LifecycleState) {
        store
            .update(job_id, |record| {
                record.monitor_pid = Some(pid);
                record.advance_to(state, "test_setup")
            })
            .expect("setup");
    }

    #[tokio::test]
    async fn functional_dead_monitor_of_live_job_is_relaunched_on_same_record() {
        let temp = tempdir().expect("tempdir");
        let store = JobStore::open(temp.path().join("state")).expect("store");
        register_job(&store, temp.path(), "10");
        set_monitor(&store, "10", 111, LifecycleState::Running);

        let scheduler = ScriptedScheduler::new(vec![Ok(LiveState::Running)], Vec::new());
        let notifier = RecordingNotifier::default();
        let rules = traceback_rules();
        let timings = instant_timings();
        let ctx = context(&store, &scheduler, &notifier, &rules, &timings);
        let launcher = FakeLauncher::new(900);

        let report = recover(&ctx, &launcher, &FakeProcesses::default())
            .await
            .expect("recover");
        assert_eq!(report.summary.restarted, 1);
        assert_eq!(launcher.launched(), vec!["10"]);
        assert!(notifier.sent().is_empty());

        let record = store.load("10").expect("load").expect("exists");
        assert_eq!(record.monitor_pid, Some(900));
        assert_eq!(record.lifecycle_state, LifecycleState::Running);
        assert_eq!(store.list().expect("list").len(), 1);
    }

    #[tokio::test]
    async fn functional_job_that_left_queue_is_finalized_in_place() {
        let temp = tempdir().expect("tempdir");
        let store = JobStore::open(temp.path().join("state")).expect("store");
        let error_log = register_job(&store, temp.path(), "20");
        std::fs::write(&error_log, "Traceback (most recent call last):\n").expect("log");
        set_monitor(&store, "20", 222, LifecycleState::Running);

        let scheduler = ScriptedScheduler::new(
            vec![Ok(LiveState::Absent)],
            vec![Some(accounting("20", "FAILED", 1))],
        );
        let notifier = RecordingNotifier::default();
        let rules = traceback_rules();
        let timings = instant_timings();
        let ctx = context(&store, &scheduler, &notifier, &rules, &timings);
        let launcher = FakeLauncher::new(900);

        let report = recover(&ctx, &launcher, &FakeProcesses::default())
            .await
            .expect("recover");
        assert_eq!(report.summary.finalized, 1);
        assert!(launcher.launched().is_empty());
        assert_eq!(
            report.jobs[0].action,
            RecoveryAction::Finalized {
                destination: Destination::Error,
                delivered: true,
            }
        );

        let record = store.load("20").expect("load").expect("exists");
        assert_eq!(record.lifecycle_state, LifecycleState::Complete);
        assert_eq!(record.matched_patterns, vec!["Python Traceback"]);
    }

    #[tokio::test]
    async fn regression_repeated_recovery_never_notifies_twice() {
        let temp = tempdir().expect("tempdir");
        let store = JobStore::open(temp.path().join("state")).expect("store");
        register_job(&store, temp.path(), "30");
        set_monitor(&store, "30", 333, LifecycleState::Finalizing);

        let scheduler = ScriptedScheduler::new(
            vec![Ok(LiveState::Absent)],
            vec![Some(accounting("30", "COMPLETED", 0))],
        );
        let notifier = RecordingNotifier::default();
        let rules = traceback_rules();
        let timings = instant_timings();
        let ctx = context(&store, &scheduler, &notifier, &rules, &timings);
        let launcher = FakeLauncher::new(900);
        let processes = FakeProcesses::default();

        let first = recover(&ctx, &launcher, &processes).await.expect("first");
        let second = recover(&ctx, &launcher, &processes).await.expect("second");
        assert_eq!(first.summary.finalized, 1);
        assert_eq!(second.summary.finalized, 0);
        assert_eq!(second.summary.untouched, 1);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn regression_cancelled_and_alive_records_are_left_alone() {
        let temp = tempdir().expect("tempdir");
        let store = JobStore::open(temp.path().join("state")).expect("store");
        register_job(&store, temp.path(), "40");
        register_job(&store, temp.path(), "41");
        store
            .update("40", |record| {
                record.divert_to_dead("monitor_cancelled");
                record.cancelled = true;
                Ok(())
            })
            .expect("cancel");
        set_monitor(&store, "41", 444, LifecycleState::Running);

        let scheduler = ScriptedScheduler::new(vec![Ok(LiveState::Absent)], Vec::new());
        let notifier = RecordingNotifier::default();
        let rules = traceback_rules();
        let timings = instant_timings();
        let ctx = context(&store, &scheduler, &notifier, &rules, &timings);
        let launcher = FakeLauncher::new(900);

        let report = recover(&ctx, &launcher, &FakeProcesses::with_alive(&[444]))
            .await
            .expect("recover");
        assert_eq!(report.summary.untouched, 2);
        assert_eq!(scheduler.live_calls(), 0);
        assert!(notifier.sent().is_empty());
        let cancelled = store.load("40").expect("load").expect("exists");
        assert_eq!(cancelled.lifecycle_state, LifecycleState::Dead);
    }

    #[tokio::test]
    async fn regression_failed_relaunch_counts_failed_and_stays_recoverable() {
        let temp = tempdir().expect("tempdir");
        let store = JobStore::open(temp.path().join("state")).expect("store");
        register_job(&store, temp.path(), "50");
        set_monitor(&store, "50", 555, LifecycleState::Running);

        let scheduler = ScriptedScheduler::new(vec![Ok(LiveState::Running)], Vec::new());
        let notifier = RecordingNotifier::default();
        let rules = traceback_rules();
        let timings = instant_timings();
        let ctx = context(&store, &scheduler, &notifier, &rules, &timings);

        let report = recover(&ctx, &FakeLauncher::failing(), &FakeProcesses::default())
            .await
            .expect("recover");
        assert_eq!(report.summary.failed, 1);

        let record = store.load("50").expect("load").expect("exists");
        assert_eq!(record.lifecycle_state, LifecycleState::Dead);
        assert_eq!(record.resume_state, Some(LifecycleState::Running));
        assert!(record.is_recoverable());

        let retry = recover(&ctx, &FakeLauncher::new(901), &FakeProcesses::default())
            .await
            .expect("retry");
        assert_eq!(retry.summary.restarted, 1);
        let record = store.load("50").expect("load").expect("exists");
        assert_eq!(record.lifecycle_state, LifecycleState::Running);
        assert_eq!(record.monitor_pid, Some(901));
    }

    #[tokio::test]
    async fn regression_pending_job_with_failed_launch_never_leaves_dead_for_pending() {
        let temp = tempdir().expect("tempdir");
        let store = JobStore::open(temp.path().join("state")).expect("store");
        register_job(&store, temp.path(), "70");
        register_job(&store, temp.path(), "71");
        launch_monitor(&store, &FakeLauncher::failing(), "70").expect_err("first launch");
        // An older record left dead while still queued.
        store
            .update("71", |record| {
                record.divert_to_dead("monitor_launch_failed");
                Ok(())
            })
            .expect("dead");

        let scheduler = ScriptedScheduler::new(vec![Ok(LiveState::Pending)], Vec::new());
        let notifier = RecordingNotifier::default();
        let rules = traceback_rules();
        let timings = instant_timings();
        let ctx = context(&store, &scheduler, &notifier, &rules, &timings);

        let report = recover(&ctx, &FakeLauncher::new(902), &FakeProcesses::default())
            .await
            .expect("recover");
        assert_eq!(report.summary.restarted, 2);
        let pending = store.load("70").expect("load").expect("exists");
        assert_eq!(pending.lifecycle_state, LifecycleState::Pending);
        assert_eq!(pending.monitor_pid, Some(902));
        let revived = store.load("71").expect("load").expect("exists");
        assert_eq!(revived.lifecycle_state, LifecycleState::Running);

        let journal = std::fs::read_to_string(store.journal_path()).expect("journal");
        for line in journal.lines() {
            let event: serde_json::Value = serde_json::from_str(line).expect("json");
            assert!(
                !(event["from"] == "dead" && event["to"] == "pending"),
                "dead record returned to pending: {line}"
            );
        }
    }

    #[tokio::test]
    async fn functional_live_query_failure_counts_as_failed() {
        let temp = tempdir().expect("tempdir");
        let store = JobStore::open(temp.path().join("state")).expect("store");
        register_job(&store, temp.path(), "60");

        let scheduler =
            ScriptedScheduler::new(vec![Err("squeue: command not found".to_string())], Vec::new());
        let notifier = RecordingNotifier::default();
        let rules = traceback_rules();
        let timings = instant_timings();
        let ctx = context(&store, &scheduler, &notifier, &rules, &timings);

        let report = recover(&ctx, &FakeLauncher::new(1), &FakeProcesses::default())
            .await
            .expect("recover");
        assert_eq!(report.summary.failed, 1);
        let record = store.load("60").expect("load").expect("exists");
        assert_eq!(record.lifecycle_state, LifecycleState::Pending);
    }
}
