//! The per-job monitor state machine.
//!
//! One monitor owns one record: it polls the live queue until the job leaves
//! it, then runs the finalize sequence (accounting, classification,
//! notification) strictly in that order. Errors return early without touching
//! `lifecycle_state`; recovery finds the record again through the dead
//! `monitor_pid`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use jobmon_classifier::{classify_log_file, RuleSet};
use jobmon_notify::{Destination, Notifier, OutcomePayload};
use jobmon_scheduler::{AccountingRecord, LiveState, SchedulerClient};
use jobmon_store::{FinalAccounting, JobRecord, JobStore, LifecycleState, StoreError, StoreResult};

pub const REASON_MONITOR_STARTED: &str = "monitor_started";
pub const REASON_JOB_PENDING: &str = "job_pending";
pub const REASON_JOB_RUNNING: &str = "job_running";
pub const REASON_JOB_LEFT_QUEUE: &str = "job_left_queue";
pub const REASON_NOTIFICATION_SENT: &str = "notification_sent";
pub const REASON_NOTIFICATION_FAILED: &str = "notification_failed";

/// Poll and retry intervals of one monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorTimings {
    pub pending_poll: Duration,
    pub running_poll: Duration,
    pub accounting_retry: Duration,
    pub accounting_attempts: u32,
    /// Pause before reading the error log so the job's last writes land.
    pub log_flush: Duration,
}

impl Default for MonitorTimings {
    fn default() -> Self {
        Self {
            pending_poll: Duration::from_secs(60),
            running_poll: Duration::from_secs(30),
            accounting_retry: Duration::from_secs(10),
            accounting_attempts: 5,
            log_flush: Duration::from_secs(5),
        }
    }
}

/// Collaborators shared by the monitor loop and in-place finalization.
pub struct MonitorContext<'a> {
    pub store: &'a JobStore,
    pub scheduler: &'a dyn SchedulerClient,
    pub notifier: &'a dyn Notifier,
    pub rules: &'a RuleSet,
    pub timings: &'a MonitorTimings,
}

/// What the finalize sequence did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeOutcome {
    pub destination: Destination,
    pub delivered: bool,
    pub final_state: Option<String>,
    pub matched_patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    Finalized(FinalizeOutcome),
    /// The record did not need (or no longer allows) a monitor.
    Skipped { reason: String },
}

/// Runs the monitor for `job_id` until the outcome is notified.
///
/// `pid` is persisted as the owning monitor process.
pub async fn run_monitor(ctx: &MonitorContext<'_>, job_id: &str, pid: u32) -> Result<MonitorExit> {
    let record = ctx
        .store
        .load(job_id)?
        .with_context(|| format!("job {job_id} is not tracked"))?;
    if let Some(reason) = skip_reason(&record) {
        tracing::info!(job_id, reason, "monitor not started");
        return Ok(MonitorExit::Skipped {
            reason: reason.to_string(),
        });
    }

    let claimed = ctx.store.update(job_id, |record| {
        ensure_monitor_owned(record)?;
        record.monitor_pid = Some(pid);
        record.reason_code = REASON_MONITOR_STARTED.to_string();
        Ok(())
    });
    let record = match claimed {
        Ok(record) => record,
        Err(error) => return skipped_or_error(job_id, error),
    };
    tracing::info!(
        job_id,
        pid,
        state = %record.lifecycle_state,
        error_log = %record.error_log_path.display(),
        "monitor started"
    );

    if record.lifecycle_state == LifecycleState::Finalizing {
        return finalize_or_skip(ctx, job_id).await;
    }

    loop {
        let live = match ctx.scheduler.live_state(job_id).await {
            Ok(live) => live,
            Err(error) => {
                tracing::warn!(job_id, %error, "live state query failed; assuming still live");
                tokio::time::sleep(ctx.timings.running_poll).await;
                continue;
            }
        };

        let (target, reason, interval) = match &live {
            LiveState::Absent => break,
            LiveState::Pending => (
                LifecycleState::Pending,
                REASON_JOB_PENDING,
                ctx.timings.pending_poll,
            ),
            LiveState::Running | LiveState::Other(_) => (
                LifecycleState::Running,
                REASON_JOB_RUNNING,
                ctx.timings.running_poll,
            ),
        };
        if let Err(error) = observe(ctx.store, job_id, target, reason) {
            return skipped_or_error(job_id, error);
        }
        tracing::debug!(job_id, ?live, next_poll_secs = interval.as_secs(), "job still live");
        tokio::time::sleep(interval).await;
    }

    tracing::info!(job_id, "job left the live queue");
    finalize_or_skip(ctx, job_id).await
}

/// Finalizes, turning a cancellation or prior notification into `Skipped`.
async fn finalize_or_skip(ctx: &MonitorContext<'_>, job_id: &str) -> Result<MonitorExit> {
    match finalize_job(ctx, job_id).await {
        Ok(outcome) => Ok(MonitorExit::Finalized(outcome)),
        Err(error) => match error.downcast::<StoreError>() {
            Ok(store_error) => skipped_or_error(job_id, store_error),
            Err(error) => Err(error),
        },
    }
}

/// Accounting, classification and notification for a job that has left the
/// live queue. Also used by recovery to finalize in place.
pub async fn finalize_job(ctx: &MonitorContext<'_>, job_id: &str) -> Result<FinalizeOutcome> {
    ctx.store.update(job_id, |record| {
        ensure_monitor_owned(record)?;
        if record.lifecycle_state != LifecycleState::Finalizing {
            record.advance_to(LifecycleState::Finalizing, REASON_JOB_LEFT_QUEUE)?;
        }
        Ok(())
    })?;

    let accounting = query_accounting(ctx, job_id).await;
    let record = ctx.store.update(job_id, |record| {
        ensure_monitor_owned(record)?;
        match &accounting {
            Some(accounting) => {
                record.record_final_accounting(&FinalAccounting {
                    final_state: accounting.state.clone(),
                    exit_code: accounting.exit_code,
                    exit_signal: accounting.signal,
                    wall_time: accounting.elapsed.clone(),
                    peak_memory: accounting.max_rss.clone(),
                    job_name: accounting.job_name.clone(),
                });
            }
            None if record.final_state.is_none() => record.accounting_indeterminate = true,
            None => {}
        }
        Ok(())
    })?;

    let succeeded = record.is_success();
    let destination = if succeeded {
        Destination::Success
    } else {
        Destination::Error
    };

    let mut payload = outcome_payload(&record);
    if record.accounting_indeterminate {
        payload.notes.push(format!(
            "final state unknown: accounting unavailable after {} attempts",
            ctx.timings.accounting_attempts.max(1)
        ));
    }

    let record = if succeeded {
        record
    } else {
        tokio::time::sleep(ctx.timings.log_flush).await;
        let report = classify_log_file(&record.error_log_path, ctx.rules);
        tracing::info!(job_id, labels = ?report.labels, "error log classified");
        payload.matched_patterns = report.labels.clone();
        payload.excerpt_lines = report.matching_lines.clone();
        payload.tail = report.tail.clone();
        payload.notes.extend(report.log_note.clone());
        ctx.store.update(job_id, |record| {
            ensure_monitor_owned(record)?;
            record.record_matched_patterns(report.labels.iter().cloned());
            Ok(())
        })?
    };

    let latest = ctx
        .store
        .load(job_id)?
        .with_context(|| format!("job {job_id} disappeared during finalization"))?;
    ensure_monitor_owned(&latest)?;

    let delivered = match ctx.notifier.notify(destination, &payload).await {
        Ok(receipt) => {
            tracing::info!(job_id, %destination, attempts = receipt.attempts, "outcome notified");
            true
        }
        Err(error) => {
            tracing::error!(job_id, %destination, %error, "outcome notification failed");
            false
        }
    };
    let reason = if delivered {
        REASON_NOTIFICATION_SENT
    } else {
        REASON_NOTIFICATION_FAILED
    };
    ctx.store
        .update(job_id, |record| record.mark_notified(delivered, reason))?;

    Ok(FinalizeOutcome {
        destination,
        delivered,
        final_state: record.final_state.clone(),
        matched_patterns: record.matched_patterns.clone(),
    })
}

async fn query_accounting(ctx: &MonitorContext<'_>, job_id: &str) -> Option<AccountingRecord> {
    let attempts = ctx.timings.accounting_attempts.max(1);
    for attempt in 1..=attempts {
        match ctx.scheduler.final_accounting(job_id).await {
            Ok(Some(record)) if record.is_terminal() => return Some(record),
            Ok(Some(record)) => {
                tracing::info!(job_id, attempt, state = %record.state, "accounting not final yet");
            }
            Ok(None) => tracing::info!(job_id, attempt, "accounting not available yet"),
            Err(error) => tracing::warn!(job_id, attempt, %error, "accounting query failed"),
        }
        if attempt < attempts {
            tokio::time::sleep(ctx.timings.accounting_retry).await;
        }
    }
    tracing::warn!(job_id, attempts, "accounting unavailable; final state indeterminate");
    None
}

fn outcome_payload(record: &JobRecord) -> OutcomePayload {
    OutcomePayload {
        job_id: record.job_id.clone(),
        final_state: record.final_state.clone(),
        exit_code: record.exit_code,
        signal: record.exit_signal,
        wall_time: record.wall_time.clone(),
        peak_memory: record.peak_memory.clone(),
        job_name: record.job_name.clone(),
        ..OutcomePayload::default()
    }
}

fn observe(
    store: &JobStore,
    job_id: &str,
    target: LifecycleState,
    reason: &str,
) -> StoreResult<JobRecord> {
    store.update(job_id, |record| {
        ensure_monitor_owned(record)?;
        // A requeued job reported as pending keeps its `running` state.
        if record.lifecycle_state != target && record.lifecycle_state.can_advance_to(target) {
            record.advance_to(target, reason)?;
        }
        Ok(())
    })
}

fn skip_reason(record: &JobRecord) -> Option<&'static str> {
    if record.cancelled {
        Some("cancelled")
    } else if record.notified {
        Some("already_notified")
    } else if record.lifecycle_state == LifecycleState::Complete {
        Some("complete")
    } else if record.lifecycle_state == LifecycleState::Dead {
        Some("dead_requires_recovery")
    } else {
        None
    }
}

fn ensure_monitor_owned(record: &JobRecord) -> StoreResult<()> {
    if record.cancelled {
        return Err(StoreError::Cancelled(record.job_id.clone()));
    }
    if record.notified {
        return Err(StoreError::AlreadyNotified(record.job_id.clone()));
    }
    if !record.lifecycle_state.is_active() {
        return Err(StoreError::InvalidTransition {
            job_id: record.job_id.clone(),
            from: record.lifecycle_state,
            to: record.lifecycle_state,
        });
    }
    Ok(())
}

fn skipped_or_error(job_id: &str, error: StoreError) -> Result<MonitorExit> {
    match error {
        StoreError::Cancelled(_) => {
            tracing::info!(job_id, "monitoring cancelled");
            Ok(MonitorExit::Skipped {
                reason: "cancelled".to_string(),
            })
        }
        StoreError::AlreadyNotified(_) => Ok(MonitorExit::Skipped {
            reason: "already_notified".to_string(),
        }),
        other => bail!(other),
    }
}
