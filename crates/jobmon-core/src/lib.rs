//! Low-level helpers shared by every jobmon crate.
//!
//! Atomic whole-file replacement for job records, wall-clock helpers and the
//! append-only JSONL journal used for lifecycle transitions.

pub mod atomic_io;
pub mod journal;
pub mod time_utils;

pub use atomic_io::{read_text_if_exists, write_text_atomic};
pub use journal::{append_jsonl_with_rotation, JournalRotationPolicy};
pub use time_utils::{current_unix_timestamp_ms, format_unix_ms_rfc3339};
