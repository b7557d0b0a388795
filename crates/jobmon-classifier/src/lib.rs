//! Data-driven failure signature matching over the tail of a job's error log.

use thiserror::Error;

mod classify;
mod rules;
mod tail;

pub use classify::{classify_lines, classify_log_file, ClassifierReport};
pub use rules::{default_pattern_rules, PatternRule, RuleSet};
pub use tail::{read_tail_lines, MAX_CLASSIFIED_LINES, MAX_TAIL_BYTES};

/// Errors raised while building a rule set.
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("pattern rule #{index} has an empty label")]
    EmptyLabel { index: usize },
    #[error("pattern rule '{label}' has an invalid regex: {source}")]
    InvalidRegex {
        label: String,
        #[source]
        source: regex::Error,
    },
}
