use std::path::Path;

use anyhow::{bail, Context, Result};
use jobmon_classifier::RuleSet;
use jobmon_notify::WebhookNotifier;
use jobmon_runtime::{
    cancel_monitor, job_status, load_config, recover, register_and_launch, render_status_table,
    resolve_watch_log_paths, run_monitor, submit_and_monitor, DetachedLauncher, JobmonConfig,
    MonitorContext, MonitorExit, MonitorTimings, RecoveryAction, RecoveryReport, SystemProcesses,
};
use jobmon_scheduler::SlurmCli;
use jobmon_store::{JobRecord, JobStore};

use crate::bootstrap_helpers::{resolve_paths, ResolvedPaths};
use crate::cli_args::{Cli, CliCommand};

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    let paths = resolve_paths(&cli)?;
    match cli.command {
        CliCommand::Submit { sbatch_args } => execute_submit(&paths, &sbatch_args).await,
        CliCommand::Watch {
            job_id,
            error,
            output,
        } => execute_watch(&paths, &job_id, error.as_deref(), output.as_deref()),
        CliCommand::Status { json } => execute_status(&paths, json),
        CliCommand::Cancel { job_id } => execute_cancel(&paths, &job_id),
        CliCommand::Recover { json } => execute_recover(&paths, json).await,
        CliCommand::TestNotify => execute_test_notify(&paths).await,
        CliCommand::Monitor { job_id } => execute_monitor(&paths, &job_id).await,
    }
}

fn open_store(paths: &ResolvedPaths) -> Result<JobStore> {
    JobStore::open(&paths.state_dir)
        .with_context(|| format!("failed to open state dir {}", paths.state_dir.display()))
}

fn launcher(paths: &ResolvedPaths, store: &JobStore) -> Result<DetachedLauncher> {
    DetachedLauncher::for_current_exe(store, Some(paths.config_path.clone()))
}

fn print_launched(store: &JobStore, record: &JobRecord) {
    println!("[jobmon] error file: {}", record.error_log_path.display());
    println!("[jobmon] output file: {}", record.output_log_path.display());
    if let Some(pid) = record.monitor_pid {
        println!("[jobmon] monitor running in background (pid {pid})");
    }
    println!(
        "[jobmon] monitor log: {}",
        store.monitor_log_path(&record.job_id).display()
    );
}

async fn execute_submit(paths: &ResolvedPaths, sbatch_args: &[String]) -> Result<()> {
    let config = load_config(&paths.config_path)?;
    let store = open_store(paths)?;
    let launcher = launcher(paths, &store)?;
    let slurm = SlurmCli::new(config.scheduler.clone());
    let cwd = std::env::current_dir().context("failed to resolve current directory")?;

    println!("[jobmon] submitting: sbatch {}", sbatch_args.join(" "));
    let submitted = submit_and_monitor(&slurm, &store, &launcher, sbatch_args, &cwd).await?;
    print!("{}", submitted.sbatch_stdout);
    println!("[jobmon] job {} submitted", submitted.record.job_id);
    print_launched(&store, &submitted.record);
    Ok(())
}

fn execute_watch(
    paths: &ResolvedPaths,
    job_id: &str,
    error: Option<&Path>,
    output: Option<&Path>,
) -> Result<()> {
    let store = open_store(paths)?;
    let launcher = launcher(paths, &store)?;
    let cwd = std::env::current_dir().context("failed to resolve current directory")?;
    if error.is_none() || output.is_none() {
        println!("[jobmon] using default log paths (override with --error/--output)");
    }
    let log_paths = resolve_watch_log_paths(job_id, error, output, &cwd);
    let record = register_and_launch(&store, &launcher, job_id, log_paths)?;
    println!("[jobmon] watching job {job_id}");
    print_launched(&store, &record);
    Ok(())
}

fn execute_status(paths: &ResolvedPaths, json: bool) -> Result<()> {
    let store = open_store(paths)?;
    let rows = job_status(&store, &SystemProcesses)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print!("{}", render_status_table(&rows));
    }
    Ok(())
}

fn execute_cancel(paths: &ResolvedPaths, job_id: &str) -> Result<()> {
    let store = open_store(paths)?;
    let outcome = cancel_monitor(&store, &SystemProcesses, job_id)?;
    match outcome.record.monitor_pid {
        Some(pid) if outcome.signalled => println!("[jobmon] sent SIGTERM to monitor pid {pid}"),
        Some(pid) => println!("[jobmon] monitor pid {pid} was not running"),
        None => {}
    }
    println!("[jobmon] monitoring of job {job_id} cancelled (the SLURM job is not affected)");
    Ok(())
}

/// Collaborators for a monitor or recovery run, built from one config.
struct MonitorDeps {
    store: JobStore,
    scheduler: SlurmCli,
    notifier: WebhookNotifier,
    rules: RuleSet,
    timings: MonitorTimings,
}

impl MonitorDeps {
    fn build(paths: &ResolvedPaths, config: &JobmonConfig) -> Result<Self> {
        Ok(Self {
            store: open_store(paths)?,
            scheduler: SlurmCli::new(config.scheduler.clone()),
            notifier: WebhookNotifier::new(config.notify.clone())
                .context("failed to build webhook client")?,
            rules: config.rule_set()?,
            timings: config.monitor_timings(),
        })
    }

    fn context(&self) -> MonitorContext<'_> {
        MonitorContext {
            store: &self.store,
            scheduler: &self.scheduler,
            notifier: &self.notifier,
            rules: &self.rules,
            timings: &self.timings,
        }
    }
}

async fn execute_recover(paths: &ResolvedPaths, json: bool) -> Result<()> {
    let config = load_config(&paths.config_path)?;
    let deps = MonitorDeps::build(paths, &config)?;
    let launcher = launcher(paths, &deps.store)?;
    let report = recover(&deps.context(), &launcher, &SystemProcesses).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_recovery_report(&report));
    }
    if report.summary.failed > 0 {
        bail!("{} job(s) could not be recovered", report.summary.failed);
    }
    Ok(())
}

fn render_recovery_report(report: &RecoveryReport) -> String {
    let mut out = String::new();
    for job in &report.jobs {
        let line = match &job.action {
            RecoveryAction::Untouched { .. } => continue,
            RecoveryAction::Restarted { monitor_pid } => match monitor_pid {
                Some(pid) => format!(
                    "job {}: still queued, monitor restarted (pid {pid})",
                    job.job_id
                ),
                None => format!("job {}: still queued, monitor restarted", job.job_id),
            },
            RecoveryAction::Finalized {
                destination,
                delivered,
            } => format!(
                "job {}: finished unobserved, {destination} notification {}",
                job.job_id,
                if *delivered { "sent" } else { "failed" }
            ),
            RecoveryAction::Failed { error } => {
                format!("job {}: recovery failed: {error}", job.job_id)
            }
        };
        out.push_str("[jobmon] ");
        out.push_str(&line);
        out.push('\n');
    }
    let summary = report.summary;
    out.push_str(&format!(
        "[jobmon] recovery: {} restarted, {} finalized, {} untouched, {} failed\n",
        summary.restarted, summary.finalized, summary.untouched, summary.failed
    ));
    out
}

async fn execute_test_notify(paths: &ResolvedPaths) -> Result<()> {
    let config = load_config(&paths.config_path)?;
    let notifier =
        WebhookNotifier::new(config.notify.clone()).context("failed to build webhook client")?;
    let mut failures = 0;
    for (destination, result) in notifier.send_test().await {
        match result {
            Ok(receipt) => println!(
                "[jobmon] {destination} webhook: ok after {} attempt(s)",
                receipt.attempts
            ),
            Err(error) => {
                failures += 1;
                println!("[jobmon] {destination} webhook: FAILED ({error})");
            }
        }
    }
    if failures > 0 {
        bail!("{failures} webhook test(s) failed");
    }
    Ok(())
}

async fn execute_monitor(paths: &ResolvedPaths, job_id: &str) -> Result<()> {
    let config = load_config(&paths.config_path)?;
    let deps = MonitorDeps::build(paths, &config)?;
    let ctx = deps.context();
    let pid = std::process::id();

    tokio::select! {
        exit = run_monitor(&ctx, job_id, pid) => match exit {
            Ok(MonitorExit::Finalized(outcome)) => {
                tracing::info!(
                    job_id,
                    destination = %outcome.destination,
                    delivered = outcome.delivered,
                    "monitor finished"
                );
                Ok(())
            }
            Ok(MonitorExit::Skipped { reason }) => {
                tracing::info!(job_id, reason = %reason, "monitor exited without work");
                Ok(())
            }
            Err(error) => {
                tracing::error!(job_id, error = %format!("{error:#}"), "monitor failed");
                Err(error)
            }
        },
        signal = shutdown_signal() => {
            signal?;
            tracing::info!(job_id, "monitor stopped by signal");
            Ok(())
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = terminate.recv() => {}
        result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")
}
