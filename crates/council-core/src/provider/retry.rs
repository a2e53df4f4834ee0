//! Error classification and backoff computation, shared by every adapter
//! through [`super::ProviderPool`].
//!
//! Grounded on `dashflow-anthropic`'s `map_http_error` status/message
//! classification, generalized to the closed set of [`ProviderError`] kinds.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::ProviderError;
use crate::types::RetryPolicy;

/// What the pool should do after an attempt has failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

/// Classify an HTTP status code into a [`ProviderError`] kind. Adapters call
/// this to build their `Result` before returning it to the pool.
#[must_use]
pub fn classify_status(provider: &str, status: u16, message: impl Into<String>) -> ProviderError {
    let message = message.into();
    match status {
        401 | 403 => ProviderError::AuthError { provider: provider.to_string(), message },
        429 => ProviderError::RateLimit {
            provider: provider.to_string(),
            message,
            retry_after_ms: None,
        },
        503 => ProviderError::ServiceUnavailable { provider: provider.to_string(), message },
        _ => ProviderError::Unknown { provider: provider.to_string(), message },
    }
}

/// Classify a transport-level or freeform error message when no HTTP status
/// is available (e.g. a hand-rolled client's connection failure).
#[must_use]
pub fn classify_message(provider: &str, message: impl Into<String>) -> ProviderError {
    let message = message.into();
    let lower = message.to_lowercase();
    if lower.contains("rate limit") {
        ProviderError::RateLimit { provider: provider.to_string(), message, retry_after_ms: None }
    } else if lower.contains("service unavailable") {
        ProviderError::ServiceUnavailable { provider: provider.to_string(), message }
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ProviderError::Timeout { provider: provider.to_string(), timeout_ms: 0 }
    } else {
        ProviderError::NetworkError { provider: provider.to_string(), message }
    }
}

/// Parse a `Retry-After` header value: either an integer count of seconds,
/// or an HTTP-date. Returns `None` if it parses as neither.
#[must_use]
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    if let Ok(seconds) = value.trim().parse::<i64>() {
        return Some(Duration::from_millis((seconds.max(0) as u64) * 1000));
    }
    if let Ok(date) = DateTime::parse_from_rfc2822(value.trim()) {
        let delta = date.with_timezone(&Utc) - now;
        let ms = delta.num_milliseconds().max(0) as u64;
        return Some(Duration::from_millis(ms));
    }
    None
}

/// Exponential backoff for attempt `k` (0-indexed): `min(initial * multiplier^k, max)`.
#[must_use]
pub fn exponential_backoff(policy: &RetryPolicy, attempt_index: u32) -> Duration {
    let scaled = policy.initial_delay_ms as f64 * policy.backoff_multiplier.powi(attempt_index as i32);
    let capped = scaled.min(policy.max_delay_ms as f64).max(0.0);
    Duration::from_millis(capped as u64)
}

/// Decide whether `attempt` (1-indexed, the attempt that just failed with
/// `err`) should be retried, and if so after what delay.
///
/// `RATE_LIMIT` additionally honors `retry_after_ms` on the error over the
/// exponential schedule, per §4.3.
#[must_use]
pub fn next_delay(policy: &RetryPolicy, attempt: u32, err: &ProviderError) -> RetryDecision {
    if attempt >= policy.max_attempts {
        return RetryDecision::GiveUp;
    }
    if !policy.retryable_error_codes.contains(&err.code()) {
        return RetryDecision::GiveUp;
    }
    let attempt_index = attempt - 1;
    if let ProviderError::RateLimit { retry_after_ms: Some(ms), .. } = err {
        return RetryDecision::Retry(Duration::from_millis(*ms));
    }
    RetryDecision::Retry(exponential_backoff(policy, attempt_index))
}
