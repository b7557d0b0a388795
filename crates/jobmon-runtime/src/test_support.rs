use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use jobmon_classifier::{PatternRule, RuleSet};
use jobmon_notify::{DeliveryReceipt, Destination, Notifier, NotifyError, OutcomePayload};
use jobmon_scheduler::{AccountingRecord, LiveState, SchedulerClient, SchedulerError};
use jobmon_store::{JobStore, NewJobRecord};

use crate::detach::MonitorLauncher;
use crate::monitor::{MonitorContext, MonitorTimings};
use crate::process::ProcessControl;

pub(crate) fn instant_timings() -> MonitorTimings {
    MonitorTimings {
        pending_poll: Duration::ZERO,
        running_poll: Duration::ZERO,
        accounting_retry: Duration::ZERO,
        accounting_attempts: 5,
        log_flush: Duration::ZERO,
    }
}

pub(crate) fn traceback_rules() -> RuleSet {
    RuleSet::compile(&[
        PatternRule::new("Python Traceback", r"Traceback \(most recent call last\)"),
        PatternRule::new("CUDA OOM", "CUDA out of memory"),
    ])
    .expect("rules")
}

pub(crate) fn register_job(store: &JobStore, dir: &Path, job_id: &str) -> PathBuf {
    let error_log = dir.join(format!("slurm-{job_id}.err"));
    store
        .create(NewJobRecord {
            job_id: job_id.to_string(),
            error_log_path: error_log.clone(),
            output_log_path: dir.join(format!("slurm-{job_id}.out")),
        })
        .expect("create");
    error_log
}

pub(crate) fn accounting(job_id: &str, state: &str, exit_code: i32) -> AccountingRecord {
    AccountingRecord {
        job_id: job_id.to_string(),
        state: state.to_string(),
        exit_code: Some(exit_code),
        signal: Some(0),
        elapsed: Some("00:05:00".to_string()),
        max_rss: Some("1024K".to_string()),
        job_name: Some("demo".to_string()),
    }
}

/// Scheduler fake answering from scripted queues; the last live answer repeats.
#[derive(Default)]
pub(crate) struct ScriptedScheduler {
    live: Mutex<VecDeque<Result<LiveState, String>>>,
    accounting: Mutex<VecDeque<Option<AccountingRecord>>>,
    live_calls: Mutex<usize>,
    accounting_calls: Mutex<usize>,
}

impl ScriptedScheduler {
    pub(crate) fn new(
        live: Vec<Result<LiveState, String>>,
        accounting: Vec<Option<AccountingRecord>>,
    ) -> Self {
        Self {
            live: Mutex::new(live.into()),
            accounting: Mutex::new(accounting.into()),
            ..Self::default()
        }
    }

    pub(crate) fn live_calls(&self) -> usize {
        *self.live_calls.lock().expect("lock")
    }

    pub(crate) fn accounting_calls(&self) -> usize {
        *self.accounting_calls.lock().expect("lock")
    }
}

#[async_trait]
impl SchedulerClient for ScriptedScheduler {
    async fn live_state(&self, _job_id: &str) -> Result<LiveState, SchedulerError> {
        *self.live_calls.lock().expect("lock") += 1;
        let mut queue = self.live.lock().expect("lock");
        let next = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        match next.unwrap_or(Ok(LiveState::Absent)) {
            Ok(state) => Ok(state),
            Err(detail) => Err(SchedulerError::CommandFailed {
                program: "squeue".to_string(),
                status: "1".to_string(),
                detail,
            }),
        }
    }

    async fn final_accounting(
        &self,
        _job_id: &str,
    ) -> Result<Option<AccountingRecord>, SchedulerError> {
        *self.accounting_calls.lock().expect("lock") += 1;
        Ok(self.accounting.lock().expect("lock").pop_front().flatten())
    }
}

/// Notifier fake recording every payload it is asked to send.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    sent: Mutex<Vec<(Destination, OutcomePayload)>>,
    fail: bool,
}

impl RecordingNotifier {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub(crate) fn sent(&self) -> Vec<(Destination, OutcomePayload)> {
        self.sent.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        destination: Destination,
        payload: &OutcomePayload,
    ) -> Result<DeliveryReceipt, NotifyError> {
        self.sent
            .lock()
            .expect("lock")
            .push((destination, payload.clone()));
        if self.fail {
            return Err(NotifyError::Exhausted {
                destination,
                attempts: 3,
                last_error: "connection refused".to_string(),
            });
        }
        Ok(DeliveryReceipt {
            destination,
            attempts: 1,
            http_status: Some(204),
        })
    }
}

/// Process table fake: pids listed in `alive` are running.
#[derive(Default)]
pub(crate) struct FakeProcesses {
    pub(crate) alive: Mutex<HashSet<u32>>,
    pub(crate) terminated: Mutex<Vec<u32>>,
}

impl FakeProcesses {
    pub(crate) fn with_alive(pids: &[u32]) -> Self {
        Self {
            alive: Mutex::new(pids.iter().copied().collect()),
            ..Self::default()
        }
    }
}

impl ProcessControl for FakeProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().expect("lock").contains(&pid)
    }

    fn terminate(&self, pid: u32) -> Result<bool> {
        self.terminated.lock().expect("lock").push(pid);
        Ok(self.alive.lock().expect("lock").remove(&pid))
    }
}

/// Launcher fake handing out increasing pids, or failing every launch.
pub(crate) struct FakeLauncher {
    next_pid: Mutex<u32>,
    launched: Mutex<Vec<String>>,
    fail: bool,
}

impl FakeLauncher {
    pub(crate) fn new(first_pid: u32) -> Self {
        Self {
            next_pid: Mutex::new(first_pid),
            launched: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(0)
        }
    }

    pub(crate) fn launched(&self) -> Vec<String> {
        self.launched.lock().expect("lock").clone()
    }
}

impl MonitorLauncher for FakeLauncher {
    fn launch(&self, job_id: &str) -> Result<u32> {
        if self.fail {
            return Err(anyhow!("spawn refused"));
        }
        self.launched.lock().expect("lock").push(job_id.to_string());
        let mut next = self.next_pid.lock().expect("lock");
        let pid = *next;
        *next += 1;
        Ok(pid)
    }
}

pub(crate) fn context<'a>(
    store: &'a JobStore,
    scheduler: &'a ScriptedScheduler,
    notifier: &'a RecordingNotifier,
    rules: &'a RuleSet,
    timings: &'a MonitorTimings,
) -> MonitorContext<'a> {
    MonitorContext {
        store,
        scheduler,
        notifier,
        rules,
        timings,
    }
}
