use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::ClassifierError;

/// One user-editable `(label, regex)` entry from configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatternRule {
    #[serde(alias = "name")]
    pub label: String,
    pub regex: String,
    #[serde(default)]
    pub case_insensitive: bool,
}

impl PatternRule {
    pub fn new(label: impl Into<String>, regex: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            regex: regex.into(),
            case_insensitive: false,
        }
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    label: String,
    regex: Regex,
}

/// Ordered, compiled rule list. Order decides label order on ties within a line.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compiles every rule. A bad pattern fails here, named by its label.
    pub fn compile(rules: &[PatternRule]) -> Result<Self, ClassifierError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for (index, rule) in rules.iter().enumerate() {
            let label = rule.label.trim();
            if label.is_empty() {
                return Err(ClassifierError::EmptyLabel { index });
            }
            let regex = RegexBuilder::new(&rule.regex)
                .case_insensitive(rule.case_insensitive)
                .build()
                .map_err(|source| ClassifierError::InvalidRegex {
                    label: label.to_string(),
                    source,
                })?;
            compiled.push(CompiledRule {
                label: label.to_string(),
                regex,
            });
        }
        Ok(Self { rules: compiled })
    }

    /// Compiles the configured rules, or the built-in set when none are configured.
    pub fn compile_or_default(rules: &[PatternRule]) -> Result<Self, ClassifierError> {
        if rules.is_empty() {
            Self::compile(&default_pattern_rules())
        } else {
            Self::compile(rules)
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub(crate) fn matching_labels<'a>(&'a self, line: &'a str) -> impl Iterator<Item = &'a str> {
        self.rules
            .iter()
            .filter(move |rule| rule.regex.is_match(line))
            .map(|rule| rule.label.as_str())
    }
}

/// Failure signatures commonly seen in SLURM job stderr.
pub fn default_pattern_rules() -> Vec<PatternRule> {
    vec![
        PatternRule::new("Python Traceback", r"Traceback \(most recent call last\)"),
        PatternRule::new("CUDA Out of Memory", r"CUDA out of memory|CUDA error: out of memory")
            .case_insensitive(),
        PatternRule::new("Host OOM Kill", r"oom[-_ ]kill|Out of memory: Killed process")
            .case_insensitive(),
        PatternRule::new("Segmentation Fault", r"Segmentation fault|SIGSEGV"),
        PatternRule::new("SLURM Time Limit", r"DUE TO TIME LIMIT"),
        PatternRule::new("SLURM Cancelled", r"\*\*\* JOB \d+ ON \S+ CANCELLED"),
        PatternRule::new("Missing Module", r"ModuleNotFoundError|ImportError"),
        PatternRule::new("Disk Quota Exceeded", r"Disk quota exceeded|No space left on device")
            .case_insensitive(),
        PatternRule::new("NCCL Error", r"NCCL (?:error|WARN)|ncclInternalError"),
        PatternRule::new("Permission Denied", r"Permission denied"),
    ]
}
