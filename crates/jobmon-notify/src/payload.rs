use serde::{Deserialize, Serialize};

/// Structured summary of a finished job handed to the notifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutcomePayload {
    pub job_id: String,
    /// `None` when accounting never produced a final state.
    pub final_state: Option<String>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub wall_time: Option<String>,
    pub peak_memory: Option<String>,
    pub job_name: Option<String>,
    #[serde(default)]
    pub matched_patterns: Vec<String>,
    #[serde(default)]
    pub excerpt_lines: Vec<String>,
    #[serde(default)]
    pub tail: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl OutcomePayload {
    pub fn state_label(&self) -> String {
        self.final_state
            .clone()
            .unwrap_or_else(|| "INDETERMINATE".to_string())
    }

    /// `N:S`, `N` or `N/A`, mirroring the scheduler's own exit code format.
    pub fn exit_code_label(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), Some(signal)) => format!("{code}:{signal}"),
            (Some(code), None) => code.to_string(),
            (None, _) => "N/A".to_string(),
        }
    }
}
