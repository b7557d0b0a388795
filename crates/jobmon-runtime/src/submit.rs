//! Job registration for `jobmon submit` and `jobmon watch`.
//!
//! Log paths follow sbatch's own precedence: command-line options win over
//! `#SBATCH` directives, and a missing stream falls back to `slurm-<id>.out`
//! in the submission directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jobmon_scheduler::SlurmCli;
use jobmon_store::{JobRecord, JobStore, NewJobRecord};

use crate::detach::{launch_monitor, MonitorLauncher};

/// sbatch short and long options that consume the following argument.
const VALUE_FLAGS: &[&str] = &[
    "-A", "--account", "-C", "--constraint", "-D", "--chdir", "-d", "--dependency", "-e",
    "--error", "-J", "--job-name", "-N", "--nodes", "-n", "--ntasks", "-o", "--output", "-p",
    "--partition", "-q", "--qos", "-t", "--time", "-w", "--nodelist", "-x", "--exclude",
    "-a", "--array", "-c", "--cpus-per-task", "--gres", "--mem", "--mem-per-cpu",
    "--ntasks-per-node", "--mail-type", "--mail-user", "--wrap",
];

/// Resolved absolute stderr and stdout paths of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub error: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct StreamOptions {
    error: Option<String>,
    output: Option<String>,
    chdir: Option<String>,
}

impl StreamOptions {
    fn or(self, fallback: StreamOptions) -> StreamOptions {
        StreamOptions {
            error: self.error.or(fallback.error),
            output: self.output.or(fallback.output),
            chdir: self.chdir.or(fallback.chdir),
        }
    }

    /// Applies one option token; `next` is consumed when the value is separate.
    fn apply(&mut self, flag: &str, next: Option<&str>) -> bool {
        let (name, inline) = match flag.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (flag, None),
        };
        let slot = match name {
            "-e" | "--error" => &mut self.error,
            "-o" | "--output" => &mut self.output,
            "-D" | "--chdir" => &mut self.chdir,
            _ => return false,
        };
        match inline.or(next) {
            Some(value) if !value.is_empty() => {
                *slot = Some(value.to_string());
                inline.is_none()
            }
            _ => false,
        }
    }
}

/// sbatch options that precede the batch script, and the script itself.
///
/// Arguments after the script belong to the script and are ignored.
fn split_sbatch_args(args: &[String], cwd: &Path) -> (StreamOptions, Option<PathBuf>) {
    let mut options = StreamOptions::default();
    let mut index = 0;
    while index < args.len() {
        let arg = args[index].as_str();
        if arg.starts_with('-') {
            let next = args.get(index + 1).map(String::as_str);
            let consumed_next = options.apply(arg, next)
                || (!arg.contains('=') && VALUE_FLAGS.contains(&arg) && next.is_some());
            index += if consumed_next { 2 } else { 1 };
            continue;
        }
        let candidate = absolutize(Path::new(arg), cwd);
        if candidate.is_file() {
            return (options, Some(candidate));
        }
        index += 1;
    }
    (options, None)
}

/// Reads `#SBATCH` stream options from a batch script header.
///
/// Like sbatch, parsing stops at the first non-comment line.
fn parse_script_directives(script: &str) -> StreamOptions {
    let mut options = StreamOptions::default();
    for line in script.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !trimmed.starts_with('#') {
            break;
        }
        let Some(rest) = trimmed.strip_prefix("#SBATCH") else {
            continue;
        };
        let tokens = rest.split_whitespace().collect::<Vec<_>>();
        let mut index = 0;
        while index < tokens.len() {
            let consumed_next = options.apply(tokens[index], tokens.get(index + 1).copied());
            index += if consumed_next { 2 } else { 1 };
        }
    }
    options
}

/// Replaces `%j` and `%J` with the job id.
pub fn substitute_job_id(pattern: &str, job_id: &str) -> String {
    pattern.replace("%j", job_id).replace("%J", job_id)
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Works out where a submitted job writes stderr and stdout.
pub fn resolve_submitted_log_paths(args: &[String], job_id: &str, cwd: &Path) -> LogPaths {
    let (cli, script_path) = split_sbatch_args(args, cwd);
    let directives = script_path
        .as_deref()
        .and_then(|path| match std::fs::read_to_string(path) {
            Ok(text) => Some(parse_script_directives(&text)),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "could not read batch script");
                None
            }
        })
        .unwrap_or_default();
    let options = cli.or(directives);

    let workdir = options
        .chdir
        .as_deref()
        .map(|dir| absolutize(Path::new(dir), cwd))
        .unwrap_or_else(|| cwd.to_path_buf());
    let resolve = |pattern: Option<&str>| {
        let raw = pattern
            .map(|pattern| substitute_job_id(pattern, job_id))
            .unwrap_or_else(|| format!("slurm-{job_id}.out"));
        absolutize(Path::new(&raw), &workdir)
    };
    LogPaths {
        error: resolve(options.error.as_deref()),
        output: resolve(options.output.as_deref()),
    }
}

/// Paths for `jobmon watch`, defaulting to `slurm-<id>.out` in `cwd`.
pub fn resolve_watch_log_paths(
    job_id: &str,
    error: Option<&Path>,
    output: Option<&Path>,
    cwd: &Path,
) -> LogPaths {
    let default = cwd.join(format!("slurm-{job_id}.out"));
    LogPaths {
        error: error.map_or_else(|| default.clone(), |path| absolutize(path, cwd)),
        output: output.map_or_else(|| default.clone(), |path| absolutize(path, cwd)),
    }
}

/// Creates the job record and launches its detached monitor.
pub fn register_and_launch(
    store: &JobStore,
    launcher: &dyn MonitorLauncher,
    job_id: &str,
    paths: LogPaths,
) -> Result<JobRecord> {
    store
        .create(NewJobRecord {
            job_id: job_id.to_string(),
            error_log_path: paths.error,
            output_log_path: paths.output,
        })
        .with_context(|| format!("failed to register job {job_id}"))?;
    launch_monitor(store, launcher, job_id)
}

/// Result of `jobmon submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub record: JobRecord,
    pub sbatch_stdout: String,
}

/// Submits through sbatch, then registers and launches a monitor.
pub async fn submit_and_monitor(
    slurm: &SlurmCli,
    store: &JobStore,
    launcher: &dyn MonitorLauncher,
    sbatch_args: &[String],
    cwd: &Path,
) -> Result<SubmittedJob> {
    let (job_id, sbatch_stdout) = slurm
        .submit_batch(sbatch_args)
        .await
        .context("sbatch submission failed")?;
    tracing::info!(job_id = %job_id, "job submitted");
    let paths = resolve_submitted_log_paths(sbatch_args, &job_id, cwd);
    let record = register_and_launch(store, launcher, &job_id, paths)?;
    Ok(SubmittedJob {
        record,
        sbatch_stdout,
    })
}
