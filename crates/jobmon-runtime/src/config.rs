use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use jobmon_classifier::{PatternRule, RuleSet};
use jobmon_core::read_text_if_exists;
use jobmon_notify::NotifyConfig;
use jobmon_scheduler::SlurmCliConfig;
use serde::{Deserialize, Serialize};

use crate::monitor::MonitorTimings;

pub const CONFIG_SCHEMA_VERSION: u32 = 1;
pub const SUCCESS_WEBHOOK_ENV: &str = "JOBMON_SUCCESS_WEBHOOK";
pub const ERROR_WEBHOOK_ENV: &str = "JOBMON_ERROR_WEBHOOK";

fn config_schema_version() -> u32 {
    CONFIG_SCHEMA_VERSION
}

fn default_pending_poll_secs() -> u64 {
    60
}

fn default_running_poll_secs() -> u64 {
    30
}

fn default_accounting_retry_secs() -> u64 {
    10
}

fn default_accounting_attempts() -> u32 {
    5
}

fn default_log_flush_secs() -> u64 {
    5
}

/// Poll and retry intervals as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimingsConfig {
    #[serde(default = "default_pending_poll_secs")]
    pub pending_poll_secs: u64,
    #[serde(default = "default_running_poll_secs")]
    pub running_poll_secs: u64,
    #[serde(default = "default_accounting_retry_secs")]
    pub accounting_retry_secs: u64,
    #[serde(default = "default_accounting_attempts")]
    pub accounting_attempts: u32,
    #[serde(default = "default_log_flush_secs")]
    pub log_flush_secs: u64,
}

impl Default for TimingsConfig {
    fn default() -> Self {
        Self {
            pending_poll_secs: default_pending_poll_secs(),
            running_poll_secs: default_running_poll_secs(),
            accounting_retry_secs: default_accounting_retry_secs(),
            accounting_attempts: default_accounting_attempts(),
            log_flush_secs: default_log_flush_secs(),
        }
    }
}

impl TimingsConfig {
    pub fn to_monitor_timings(&self) -> MonitorTimings {
        MonitorTimings {
            pending_poll: Duration::from_secs(self.pending_poll_secs),
            running_poll: Duration::from_secs(self.running_poll_secs),
            accounting_retry: Duration::from_secs(self.accounting_retry_secs),
            accounting_attempts: self.accounting_attempts,
            log_flush: Duration::from_secs(self.log_flush_secs),
        }
    }
}

/// Whole `config.json`, loaded once and passed to components explicitly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobmonConfig {
    #[serde(default = "config_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub patterns: Vec<PatternRule>,
    #[serde(default)]
    pub scheduler: SlurmCliConfig,
    #[serde(default)]
    pub timings: TimingsConfig,
}

impl Default for JobmonConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            notify: NotifyConfig::default(),
            patterns: Vec::new(),
            scheduler: SlurmCliConfig::default(),
            timings: TimingsConfig::default(),
        }
    }
}

impl JobmonConfig {
    /// Compiled classifier rules; the built-in set when none are configured.
    pub fn rule_set(&self) -> Result<RuleSet> {
        RuleSet::compile_or_default(&self.patterns).context("invalid error pattern configuration")
    }

    pub fn monitor_timings(&self) -> MonitorTimings {
        self.timings.to_monitor_timings()
    }

    /// Replaces webhook URLs with non-empty values returned by `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(value) = non_empty(SUCCESS_WEBHOOK_ENV) {
            self.notify.success_webhook = value;
        }
        if let Some(value) = non_empty(ERROR_WEBHOOK_ENV) {
            self.notify.error_webhook = value;
        }
    }
}

/// Loads the config file (all defaults when it does not exist) and applies
/// environment overrides. Invalid patterns fail here rather than in a monitor.
pub fn load_config(path: &Path) -> Result<JobmonConfig> {
    let mut config = match read_text_if_exists(path)? {
        Some(raw) => serde_json::from_str::<JobmonConfig>(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?,
        None => JobmonConfig::default(),
    };
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        bail!(
            "unsupported config schema_version {} in {} (expected {})",
            config.schema_version,
            path.display(),
            CONFIG_SCHEMA_VERSION
        );
    }
    config.apply_env_overrides(|key| std::env::var(key).ok());
    config.rule_set()?;
    if config.timings.accounting_attempts == 0 {
        bail!(
            "timings.accounting_attempts in {} must be greater than 0",
            path.display()
        );
    }
    Ok(config)
}
