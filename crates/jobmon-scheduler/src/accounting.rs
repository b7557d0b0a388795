use serde::{Deserialize, Serialize};

const TERMINAL_STATES: &[&str] = &[
    "COMPLETED",
    "FAILED",
    "CANCELLED",
    "TIMEOUT",
    "OUT_OF_MEMORY",
    "NODE_FAIL",
    "PREEMPTED",
    "BOOT_FAIL",
    "DEADLINE",
    "REVOKED",
];

/// Final accounting values reported for a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountingRecord {
    pub job_id: String,
    /// Normalised state word, e.g. `CANCELLED` for `CANCELLED by 1000`.
    pub state: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub elapsed: Option<String>,
    pub max_rss: Option<String>,
    pub job_name: Option<String>,
}

impl AccountingRecord {
    /// Clean success: `COMPLETED` with exit code 0 and no terminating signal.
    pub fn is_success(&self) -> bool {
        self.state == "COMPLETED" && self.exit_code == Some(0) && self.signal.unwrap_or(0) == 0
    }

    /// True once the scheduler reports a final state rather than a live one.
    pub fn is_terminal(&self) -> bool {
        TERMINAL_STATES.contains(&self.state.as_str())
    }
}

/// Splits a `N:S` exit code field into exit status and signal.
pub fn parse_exit_code(raw: &str) -> (Option<i32>, Option<i32>) {
    let raw = raw.trim();
    match raw.split_once(':') {
        Some((code, signal)) => (code.trim().parse().ok(), signal.trim().parse().ok()),
        None => (raw.parse().ok(), None),
    }
}

/// Parses a `MaxRSS` value (`2048K`, `1.5G`, `512`) into bytes.
pub fn parse_memory_bytes(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (number, multiplier) = match raw.chars().last()?.to_ascii_uppercase() {
        'K' => (&raw[..raw.len() - 1], 1024_f64),
        'M' => (&raw[..raw.len() - 1], 1024_f64.powi(2)),
        'G' => (&raw[..raw.len() - 1], 1024_f64.powi(3)),
        'T' => (&raw[..raw.len() - 1], 1024_f64.powi(4)),
        _ => (raw, 1_f64),
    };
    let value = number.trim().parse::<f64>().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier).round() as u64)
}

pub(crate) fn normalize_state(raw: &str) -> String {
    raw.split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_end_matches('+')
        .to_ascii_uppercase()
}
