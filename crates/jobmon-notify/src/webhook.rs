use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::render::{render_test_body, render_webhook_body};
use crate::retry::{is_retryable_http_error, next_backoff_ms, should_retry_status};
use crate::{DeliveryReceipt, Destination, Notifier, NotifyError, OutcomePayload};

fn default_timeout_ms() -> u64 {
    15_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

/// Webhook endpoints and retry budget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotifyConfig {
    #[serde(default)]
    pub success_webhook: String,
    #[serde(default)]
    pub error_webhook: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            success_webhook: String::new(),
            error_webhook: String::new(),
            timeout_ms: default_timeout_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl NotifyConfig {
    pub fn webhook_for(&self, destination: Destination) -> &str {
        match destination {
            Destination::Success => self.success_webhook.trim(),
            Destination::Error => self.error_webhook.trim(),
        }
    }
}

enum AttemptFailure {
    Retryable(String),
    Fatal(NotifyError),
}

/// Delivers outcomes to Discord-compatible webhooks with bounded retry.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    config: NotifyConfig,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: NotifyConfig) -> Result<Self, NotifyError> {
        if config.timeout_ms == 0 {
            return Err(NotifyError::Client(
                "webhook timeout must be greater than 0ms".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|error| NotifyError::Client(error.to_string()))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &NotifyConfig {
        &self.config
    }

    /// Posts a test message to both destinations and reports each result.
    pub async fn send_test(&self) -> Vec<(Destination, Result<DeliveryReceipt, NotifyError>)> {
        let mut results = Vec::with_capacity(2);
        for destination in [Destination::Success, Destination::Error] {
            let result = self.post(destination, &render_test_body(destination)).await;
            results.push((destination, result));
        }
        results
    }

    async fn post(
        &self,
        destination: Destination,
        body: &Value,
    ) -> Result<DeliveryReceipt, NotifyError> {
        let url = self.config.webhook_for(destination);
        if url.is_empty() {
            return Err(NotifyError::DestinationNotConfigured(destination));
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match self.attempt(destination, url, body).await {
                Ok(status) => {
                    tracing::info!(%destination, attempt, status, "notification delivered");
                    return Ok(DeliveryReceipt {
                        destination,
                        attempts: attempt,
                        http_status: Some(status),
                    });
                }
                Err(AttemptFailure::Fatal(error)) => {
                    tracing::warn!(%destination, attempt, %error, "notification rejected");
                    return Err(error);
                }
                Err(AttemptFailure::Retryable(detail)) => {
                    tracing::warn!(
                        %destination,
                        attempt,
                        max_attempts,
                        error = %detail,
                        "notification attempt failed"
                    );
                    last_error = detail;
                    if attempt < max_attempts {
                        let delay = next_backoff_ms(self.config.backoff_base_ms, attempt - 1);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        Err(NotifyError::Exhausted {
            destination,
            attempts: max_attempts,
            last_error,
        })
    }

    async fn attempt(
        &self,
        destination: Destination,
        url: &str,
        body: &Value,
    ) -> Result<u16, AttemptFailure> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|error| {
                if is_retryable_http_error(&error) {
                    AttemptFailure::Retryable(error.to_string())
                } else {
                    AttemptFailure::Fatal(NotifyError::Exhausted {
                        destination,
                        attempts: 1,
                        last_error: error.to_string(),
                    })
                }
            })?;
        let status = response.status().as_u16();
        if response.status().is_success() {
            return Ok(status);
        }
        if should_retry_status(status) {
            return Err(AttemptFailure::Retryable(format!("http status {status}")));
        }
        Err(AttemptFailure::Fatal(NotifyError::Rejected {
            destination,
            status,
        }))
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(
        &self,
        destination: Destination,
        payload: &OutcomePayload,
    ) -> Result<DeliveryReceipt, NotifyError> {
        let body = render_webhook_body(destination, payload);
        self.post(destination, &body).await
    }
}
