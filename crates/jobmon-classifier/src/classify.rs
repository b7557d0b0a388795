use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::rules::RuleSet;
use crate::tail::{read_tail_lines, MAX_CLASSIFIED_LINES};

const MAX_MATCHING_LINES: usize = 10;
const MAX_LINE_CHARS: usize = 200;
const TAIL_EXCERPT_LINES: usize = 20;

/// Result of classifying one error log.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassifierReport {
    /// Matched labels in first-match order, duplicates collapsed.
    pub labels: Vec<String>,
    /// Trimmed lines that produced a label, capped for notification excerpts.
    pub matching_lines: Vec<String>,
    /// Last lines of the classified input.
    pub tail: Vec<String>,
    /// Set when the log could not be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_note: Option<String>,
}

impl ClassifierReport {
    pub fn has_matches(&self) -> bool {
        !self.labels.is_empty()
    }
}

/// Classifies an in-memory line sequence, considering only its last 500 lines.
pub fn classify_lines<S: AsRef<str>>(lines: &[S], rules: &RuleSet) -> ClassifierReport {
    let start = lines.len().saturating_sub(MAX_CLASSIFIED_LINES);
    let window = &lines[start..];

    let mut report = ClassifierReport::default();
    for line in window {
        let line = line.as_ref();
        let mut line_matched = false;
        for label in rules.matching_labels(line) {
            line_matched = true;
            if !report.labels.iter().any(|known| known == label) {
                report.labels.push(label.to_string());
            }
        }
        if line_matched && report.matching_lines.len() < MAX_MATCHING_LINES {
            report.matching_lines.push(excerpt(line));
        }
    }

    let tail_start = window.len().saturating_sub(TAIL_EXCERPT_LINES);
    report.tail = window[tail_start..]
        .iter()
        .map(|line| excerpt(line.as_ref()))
        .collect();
    report
}

/// Reads the tail of `path` and classifies it. A missing or unreadable file
/// yields an empty report with a `log_note`, never an error.
pub fn classify_log_file(path: &Path, rules: &RuleSet) -> ClassifierReport {
    match read_tail_lines(path, MAX_CLASSIFIED_LINES) {
        Ok(lines) => classify_lines(&lines, rules),
        Err(error) if error.kind() == ErrorKind::NotFound => ClassifierReport {
            log_note: Some(format!("error log not found: {}", path.display())),
            ..ClassifierReport::default()
        },
        Err(error) => ClassifierReport {
            log_note: Some(format!(
                "could not read error log {}: {error}",
                path.display()
            )),
            ..ClassifierReport::default()
        },
    }
}

fn excerpt(line: &str) -> String {
    line.trim().chars().take(MAX_LINE_CHARS).collect()
}
