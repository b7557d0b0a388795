use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "jobmon",
    about = "SLURM job monitor with webhook notifications",
    version
)]
pub struct Cli {
    #[arg(
        long = "state-dir",
        env = "JOBMON_STATE_DIR",
        global = true,
        help = "Directory holding job records, monitor logs and config.json. Defaults to ~/.jobmon."
    )]
    pub state_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "JOBMON_CONFIG",
        global = true,
        help = "Config file path. Defaults to <state-dir>/config.json."
    )]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Submit a batch script through sbatch and monitor it in the background
    Submit {
        /// Arguments passed to sbatch unchanged (options, script, script arguments)
        #[arg(
            required = true,
            num_args = 1..,
            trailing_var_arg = true,
            allow_hyphen_values = true
        )]
        sbatch_args: Vec<String>,
    },
    /// Monitor an already-submitted job
    Watch {
        job_id: String,
        /// Job stderr file. Defaults to slurm-<job_id>.out in the current directory
        #[arg(long)]
        error: Option<PathBuf>,
        /// Job stdout file. Defaults to slurm-<job_id>.out in the current directory
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show every monitored job
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Stop monitoring a job (the SLURM job keeps running)
    Cancel { job_id: String },
    /// Restart dead monitors and finalize jobs that ended unobserved
    Recover {
        #[arg(long)]
        json: bool,
    },
    /// Post a test message to both webhooks
    TestNotify,
    /// Detached monitor entry point
    #[command(hide = true)]
    Monitor { job_id: String },
}

impl CliCommand {
    pub fn is_daemon(&self) -> bool {
        matches!(self, Self::Monitor { .. })
    }
}
