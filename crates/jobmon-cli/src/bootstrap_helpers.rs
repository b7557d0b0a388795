use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use crate::cli_args::Cli;

/// Interactive commands log warnings only. The detached monitor logs at info,
/// without ANSI colors, into the stderr its launcher redirected to a file.
pub(crate) fn init_tracing(daemon: bool) {
    let default_level = if daemon {
        LevelFilter::INFO
    } else {
        LevelFilter::WARN
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(!daemon)
        .with_target(false)
        .compact()
        .init();
}

/// State directory and config file a command operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedPaths {
    pub(crate) state_dir: PathBuf,
    pub(crate) config_path: PathBuf,
}

pub(crate) fn resolve_paths(cli: &Cli) -> Result<ResolvedPaths> {
    let state_dir = match &cli.state_dir {
        Some(dir) => dir.clone(),
        None => default_state_dir()?,
    };
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| state_dir.join("config.json"));
    Ok(ResolvedPaths {
        state_dir,
        config_path,
    })
}

fn default_state_dir() -> Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .filter(|value| !value.is_empty())
        .context("HOME is not set; pass --state-dir or set JOBMON_STATE_DIR")?;
    Ok(PathBuf::from(home).join(".jobmon"))
}
