use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::accounting::{normalize_state, parse_exit_code, parse_memory_bytes, AccountingRecord};
use crate::{LiveState, SchedulerClient, SchedulerError};

const SACCT_FORMAT: &str = "JobID,State,ExitCode,Elapsed,MaxRSS,JobName";
const INVALID_JOB_ID_MARKER: &str = "invalid job id";
const SUBMITTED_PREFIX: &str = "Submitted batch job";

fn default_squeue() -> String {
    "squeue".to_string()
}

fn default_sacct() -> String {
    "sacct".to_string()
}

fn default_sbatch() -> String {
    "sbatch".to_string()
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

/// Executables and timeout used by [`SlurmCli`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlurmCliConfig {
    #[serde(default = "default_squeue")]
    pub squeue: String,
    #[serde(default = "default_sacct")]
    pub sacct: String,
    #[serde(default = "default_sbatch")]
    pub sbatch: String,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for SlurmCliConfig {
    fn default() -> Self {
        Self {
            squeue: default_squeue(),
            sacct: default_sacct(),
            sbatch: default_sbatch(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

struct CommandOutput {
    success: bool,
    status: String,
    stdout: String,
    stderr: String,
}

/// SLURM scheduler adapter that shells out to `squeue`, `sacct` and `sbatch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlurmCli {
    config: SlurmCliConfig,
}

impl SlurmCli {
    pub fn new(config: SlurmCliConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SlurmCliConfig {
        &self.config
    }

    /// Runs `sbatch` with `args` and returns the job id it reports.
    ///
    /// The scheduler's own stdout is returned alongside so callers can echo it.
    pub async fn submit_batch(&self, args: &[String]) -> Result<(String, String), SchedulerError> {
        let output = self.run(&self.config.sbatch, args).await?;
        if !output.success {
            return Err(SchedulerError::CommandFailed {
                program: self.config.sbatch.clone(),
                status: output.status,
                detail: summarize_process_failure(&output.stderr, &output.stdout),
            });
        }
        let job_id = parse_submitted_job_id(&output.stdout).ok_or_else(|| {
            SchedulerError::UnexpectedOutput {
                program: self.config.sbatch.clone(),
                detail: summarize_process_failure("", &output.stdout),
            }
        })?;
        Ok((job_id, output.stdout))
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, SchedulerError> {
        let mut command = Command::new(program);
        command.kill_on_drop(true);
        command.args(args);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        let child = command.spawn().map_err(|source| SchedulerError::Spawn {
            program: program.to_string(),
            source,
        })?;

        let timeout_ms = self.config.command_timeout_ms;
        let output = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| SchedulerError::Timeout {
            program: program.to_string(),
            timeout_ms,
        })?
        .map_err(|source| SchedulerError::Spawn {
            program: program.to_string(),
            source,
        })?;

        let status = output
            .status
            .code()
            .map(|value| value.to_string())
            .unwrap_or_else(|| "signal".to_string());
        Ok(CommandOutput {
            success: output.status.success(),
            status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[async_trait]
impl SchedulerClient for SlurmCli {
    async fn live_state(&self, job_id: &str) -> Result<LiveState, SchedulerError> {
        let args = ["-j", job_id, "-h", "-o", "%T"].map(str::to_string);
        let output = self.run(&self.config.squeue, &args).await?;
        if !output.success {
            if output
                .stderr
                .to_ascii_lowercase()
                .contains(INVALID_JOB_ID_MARKER)
            {
                return Ok(LiveState::Absent);
            }
            return Err(SchedulerError::CommandFailed {
                program: self.config.squeue.clone(),
                status: output.status,
                detail: summarize_process_failure(&output.stderr, &output.stdout),
            });
        }
        Ok(parse_squeue_output(&output.stdout))
    }

    async fn final_accounting(
        &self,
        job_id: &str,
    ) -> Result<Option<AccountingRecord>, SchedulerError> {
        let args = ["-j", job_id, "--parsable2", "--noheader", "-o", SACCT_FORMAT]
            .map(str::to_string);
        let output = self.run(&self.config.sacct, &args).await?;
        if !output.success {
            return Err(SchedulerError::CommandFailed {
                program: self.config.sacct.clone(),
                status: output.status,
                detail: summarize_process_failure(&output.stderr, &output.stdout),
            });
        }
        Ok(parse_sacct_output(job_id, &output.stdout))
    }
}

/// First non-empty `squeue -h -o %T` line, or `Absent` for empty output.
pub fn parse_squeue_output(stdout: &str) -> LiveState {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(LiveState::from_queue_state)
        .unwrap_or(LiveState::Absent)
}

/// Builds an accounting record from `sacct --parsable2` output.
///
/// The base job line supplies state, exit code, elapsed and name. Peak memory
/// is the base line's `MaxRSS` when present, else the largest across steps.
pub fn parse_sacct_output(job_id: &str, stdout: &str) -> Option<AccountingRecord> {
    let step_prefix = format!("{job_id}.");
    let mut base: Option<AccountingRecord> = None;
    let mut peak_step: Option<(u64, String)> = None;

    for line in stdout.lines() {
        let fields = line.trim_end().split('|').collect::<Vec<_>>();
        if fields.len() < 6 {
            continue;
        }
        let row_id = fields[0].trim();
        if row_id == job_id {
            let (exit_code, signal) = parse_exit_code(fields[2]);
            base = Some(AccountingRecord {
                job_id: job_id.to_string(),
                state: normalize_state(fields[1]),
                exit_code,
                signal,
                elapsed: non_empty(fields[3]),
                max_rss: non_empty(fields[4]),
                job_name: non_empty(fields[5]),
            });
        } else if row_id.starts_with(&step_prefix) {
            let raw = fields[4].trim();
            if let Some(bytes) = parse_memory_bytes(raw) {
                if peak_step.as_ref().map_or(true, |(best, _)| bytes > *best) {
                    peak_step = Some((bytes, raw.to_string()));
                }
            }
        }
    }

    let mut record = base?;
    if record.state.is_empty() {
        return None;
    }
    if record.max_rss.is_none() {
        record.max_rss = peak_step.map(|(_, raw)| raw);
    }
    Some(record)
}

/// Extracts the id from `Submitted batch job <id>` (also `... on cluster <name>`).
pub fn parse_submitted_job_id(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let rest = line.trim().strip_prefix(SUBMITTED_PREFIX)?;
        let id = rest.split_whitespace().next()?;
        id.chars()
            .all(|ch| ch.is_ascii_digit())
            .then(|| id.to_string())
    })
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn summarize_process_failure(stderr: &str, stdout: &str) -> String {
    const MAX_CHARS: usize = 240;
    let text = [stderr.trim(), stdout.trim()]
        .into_iter()
        .find(|text| !text.is_empty())
        .unwrap_or("no error output");
    if text.chars().count() <= MAX_CHARS {
        return text.to_string();
    }
    text.chars().take(MAX_CHARS).collect::<String>() + "..."
}
