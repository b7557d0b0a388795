use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

const DEFAULT_JOURNAL_MAX_BYTES: u64 = 4 * 1024 * 1024;
const DEFAULT_JOURNAL_MAX_FILES: usize = 3;

/// Size-based rotation limits for the transition journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalRotationPolicy {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for JournalRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_JOURNAL_MAX_BYTES,
            max_files: DEFAULT_JOURNAL_MAX_FILES,
        }
    }
}

impl JournalRotationPolicy {
    /// Reads `JOBMON_JOURNAL_MAX_BYTES` / `JOBMON_JOURNAL_MAX_FILES`, ignoring invalid values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_bytes = std::env::var("JOBMON_JOURNAL_MAX_BYTES")
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(defaults.max_bytes);
        let max_files = std::env::var("JOBMON_JOURNAL_MAX_FILES")
            .ok()
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(defaults.max_files);
        Self {
            max_bytes,
            max_files,
        }
    }
}

/// Serializes `value` as one JSON line and appends it to `path`.
///
/// When the append would push the file past `policy.max_bytes` the current
/// file is shifted to `<path>.1` (older backups to `.2`, ...) first, keeping at
/// most `policy.max_files` files in total.
pub fn append_jsonl_with_rotation<T>(
    path: &Path,
    value: &T,
    policy: JournalRotationPolicy,
) -> Result<()>
where
    T: Serialize,
{
    let line = serde_json::to_string(value).context("failed to encode journal entry")?;
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    if let Ok(metadata) = std::fs::metadata(path) {
        let incoming = u64::try_from(line.len().saturating_add(1)).unwrap_or(u64::MAX);
        if metadata.len().saturating_add(incoming) > policy.max_bytes {
            shift_backups(path, policy.max_files)?;
        }
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append {}", path.display()))?;
    Ok(())
}

fn backup_path(path: &Path, index: usize) -> PathBuf {
    PathBuf::from(format!("{}.{index}", path.display()))
}

fn shift_backups(path: &Path, max_files: usize) -> Result<()> {
    if max_files <= 1 {
        return std::fs::remove_file(path)
            .with_context(|| format!("failed to truncate {}", path.display()));
    }
    let oldest = max_files - 1;
    let oldest_path = backup_path(path, oldest);
    if oldest_path.exists() {
        std::fs::remove_file(&oldest_path)
            .with_context(|| format!("failed to drop {}", oldest_path.display()))?;
    }
    for index in (1..oldest).rev() {
        let source = backup_path(path, index);
        if source.exists() {
            let destination = backup_path(path, index + 1);
            std::fs::rename(&source, &destination)
                .with_context(|| format!("failed to shift {}", source.display()))?;
        }
    }
    std::fs::rename(path, backup_path(path, 1))
        .with_context(|| format!("failed to rotate {}", path.display()))
}
