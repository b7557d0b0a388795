use jobmon_core::{current_unix_timestamp_ms, format_unix_ms_rfc3339};
use serde_json::{json, Value};

use crate::{Destination, OutcomePayload};

const SUCCESS_COLOR: u32 = 0x2ECC71;
const ERROR_COLOR: u32 = 0xE74C3C;
const FOOTER_TEXT: &str = "SLURM Job Monitor (jobmon)";
const FIELD_VALUE_MAX_CHARS: usize = 1024;
const EXCERPT_LINES: usize = 8;
const TAIL_LINES: usize = 10;

fn destination_color(destination: Destination) -> u32 {
    match destination {
        Destination::Success => SUCCESS_COLOR,
        Destination::Error => ERROR_COLOR,
    }
}

/// Renders a Discord-compatible webhook body (`{"embeds": [...]}`) for an outcome.
///
/// Styling follows the destination chosen by the caller, never the payload.
pub fn render_webhook_body(destination: Destination, payload: &OutcomePayload) -> Value {
    let state = payload.state_label();
    let title = match destination {
        Destination::Success => format!("\u{2705} Job `{}` {state}", payload.job_id),
        Destination::Error => format!("\u{274C} Job `{}` {state}", payload.job_id),
    };

    let mut fields = vec![
        inline_field("Job ID", format!("`{}`", payload.job_id)),
        inline_field("State", state),
        inline_field("Exit Code", payload.exit_code_label()),
        inline_field("Elapsed", or_na(payload.wall_time.as_deref())),
        inline_field("Job Name", or_na(payload.job_name.as_deref())),
        inline_field("Max RSS", or_na(payload.peak_memory.as_deref())),
    ];

    if destination == Destination::Error {
        if !payload.matched_patterns.is_empty() {
            fields.push(block_field(
                "Errors Detected",
                cap_chars(&payload.matched_patterns.join(", ")),
            ));
        }
        if !payload.excerpt_lines.is_empty() {
            let lines = payload
                .excerpt_lines
                .iter()
                .take(EXCERPT_LINES)
                .cloned()
                .collect::<Vec<_>>();
            fields.push(block_field("Relevant Error Lines", code_block(&lines)));
        }
        if !payload.tail.is_empty() {
            let start = payload.tail.len().saturating_sub(TAIL_LINES);
            fields.push(block_field(
                "Last Lines of Stderr",
                code_block(&payload.tail[start..]),
            ));
        }
    }
    if !payload.notes.is_empty() {
        fields.push(block_field("Notes", cap_chars(&payload.notes.join("\n"))));
    }

    json!({
        "embeds": [{
            "title": title,
            "color": destination_color(destination),
            "fields": fields,
            "footer": { "text": FOOTER_TEXT },
            "timestamp": format_unix_ms_rfc3339(current_unix_timestamp_ms()),
        }]
    })
}

/// Renders the connectivity check message sent by `jobmon test-notify`.
pub fn render_test_body(destination: Destination) -> Value {
    let title = match destination {
        Destination::Success => "\u{2705} jobmon test: success channel",
        Destination::Error => "\u{274C} jobmon test: error channel",
    };
    json!({
        "embeds": [{
            "title": title,
            "description": format!(
                "Test message sent at {}",
                format_unix_ms_rfc3339(current_unix_timestamp_ms())
            ),
            "color": destination_color(destination),
            "footer": { "text": FOOTER_TEXT },
        }]
    })
}

fn inline_field(name: &str, value: String) -> Value {
    json!({ "name": name, "value": value, "inline": true })
}

fn block_field(name: &str, value: String) -> Value {
    json!({ "name": name, "value": value, "inline": false })
}

fn or_na(value: Option<&str>) -> String {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("N/A")
        .to_string()
}

fn code_block(lines: &[String]) -> String {
    // Fence adds 8 characters around the body.
    let body = truncate_chars(&lines.join("\n"), FIELD_VALUE_MAX_CHARS - 8);
    format!("```\n{body}\n```")
}

fn cap_chars(text: &str) -> String {
    truncate_chars(text, FIELD_VALUE_MAX_CHARS)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept = text.chars().take(max_chars.saturating_sub(3)).collect::<String>();
    kept + "..."
}
