/// Status codes worth another attempt: timeouts, conflicts, throttling and server errors.
pub fn should_retry_status(status: u16) -> bool {
    status == 408 || status == 409 || status == 425 || status == 429 || status >= 500
}

/// Doubling backoff from `base_ms`, capped at 2^6 times the base.
pub fn next_backoff_ms(base_ms: u64, attempt: u32) -> u64 {
    let shift = attempt.min(6);
    base_ms.saturating_mul(1_u64 << shift)
}

pub fn is_retryable_http_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}
