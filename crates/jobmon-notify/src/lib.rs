//! Outcome notification delivery for finished jobs.
//!
//! The monitor picks a [`Destination`]; the notifier only renders and delivers,
//! with a bounded number of attempts.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod payload;
mod render;
mod retry;
mod webhook;

pub use payload::OutcomePayload;
pub use render::{render_test_body, render_webhook_body};
pub use retry::{is_retryable_http_error, next_backoff_ms, should_retry_status};
pub use webhook::{NotifyConfig, WebhookNotifier};

/// Logical notification channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Success,
    Error,
}

impl Destination {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proof of an accepted delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub destination: Destination,
    pub attempts: u32,
    pub http_status: Option<u16>,
}

/// Delivery failures surfaced to the monitor.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no webhook configured for the {0} destination")]
    DestinationNotConfigured(Destination),
    #[error("webhook for the {destination} destination rejected the message with status {status}")]
    Rejected { destination: Destination, status: u16 },
    #[error("delivery to the {destination} destination failed after {attempts} attempts: {last_error}")]
    Exhausted {
        destination: Destination,
        attempts: u32,
        last_error: String,
    },
    #[error("failed to build webhook client: {0}")]
    Client(String),
}

/// Sends one structured outcome to one destination.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        destination: Destination,
        payload: &OutcomePayload,
    ) -> Result<DeliveryReceipt, NotifyError>;
}
