//! Outbound connection pool: adapter trait, shared retry helper, health and
//! rate-limit bookkeeping.
//!
//! Follows the §9 redesign flag literally: a `ProviderAdapter` interface
//! plus a shared retry/backoff helper consumed by each concrete adapter,
//! rather than a `BaseProviderAdapter` class hierarchy.

pub mod health;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::types::{CouncilMember, TokenUsage};

pub use health::{HealthStatus, ProviderHealth, RateLimitStatus};
pub use retry::{classify_status, classify_message, RetryDecision};

/// Canonical outbound prompt shape: a query plus optional prior turns.
#[derive(Debug, Clone)]
pub struct ProviderPrompt {
    pub query: String,
    pub context: Vec<(crate::types::Role, String)>,
}

/// Canonical response shape every adapter must translate its provider's wire
/// format into.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub content: String,
    pub token_usage: TokenUsage,
    pub latency: Duration,
}

/// One adapter per provider. Adapters translate between the canonical
/// request/response shape and the provider's wire format; they MUST NOT
/// retry internally — retry is the pool's job.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_name(&self) -> &str;

    async fn send(
        &self,
        member: &CouncilMember,
        prompt: &ProviderPrompt,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Lightweight liveness probe, used to drive recovery from `disabled`.
    async fn health(&self) -> Result<Duration, ProviderError>;
}

/// Routes calls to the correct adapter, applying retry/backoff, per-call
/// timeout, and fleet health tracking.
pub struct ProviderPool {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    health: health::HealthRegistry,
}

impl ProviderPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            health: health::HealthRegistry::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider_name().to_string(), adapter);
    }

    #[must_use]
    pub fn health_snapshot(&self, provider: &str) -> ProviderHealth {
        self.health.snapshot(provider)
    }

    /// Invoke `member` with the pool's retry loop and per-call timeout.
    pub async fn call(
        &self,
        member: &CouncilMember,
        prompt: &ProviderPrompt,
    ) -> Result<ProviderResponse, ProviderError> {
        let adapter = self.adapters.get(&member.provider).ok_or_else(|| ProviderError::Unknown {
            provider: member.provider.clone(),
            message: format!("no adapter registered for provider {}", member.provider),
        })?;

        if !self.health.should_probe(&member.provider) {
            return Err(ProviderError::ServiceUnavailable {
                provider: member.provider.clone(),
                message: "provider disabled after repeated failures".into(),
            });
        }

        let policy = &member.retry_policy;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let call_start = Instant::now();
            let outcome = tokio::time::timeout(member.timeout(), adapter.send(member, prompt)).await;

            let result = match outcome {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(ProviderError::Timeout {
                    provider: member.provider.clone(),
                    timeout_ms: member.timeout().as_millis() as u64,
                }),
            };

            match result {
                Ok(response) => {
                    self.health.record_success(&member.provider, call_start.elapsed());
                    return Ok(response);
                }
                Err(err) => {
                    self.health.record_failure(&member.provider, &err);
                    let decision = retry::next_delay(policy, attempt, &err);
                    match decision {
                        RetryDecision::Retry(delay) => {
                            debug!(
                                provider = %member.provider,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "retrying provider call"
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        RetryDecision::GiveUp => {
                            warn!(provider = %member.provider, attempt, "provider call exhausted retries");
                            return Err(err);
                        }
                    }
                }
            }
        }
    }
}

impl Default for ProviderPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FlakyAdapter {
        attempts: AtomicU32,
        fail_until: u32,
        retry_after_ms: Mutex<Option<u64>>,
    }

    #[async_trait]
    impl ProviderAdapter for FlakyAdapter {
        fn provider_name(&self) -> &str {
            "flaky"
        }

        async fn send(
            &self,
            _member: &CouncilMember,
            _prompt: &ProviderPrompt,
        ) -> Result<ProviderResponse, ProviderError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.fail_until {
                return Err(ProviderError::RateLimit {
                    provider: "flaky".into(),
                    message: "rate limit exceeded".into(),
                    retry_after_ms: *self.retry_after_ms.lock().unwrap(),
                });
            }
            Ok(ProviderResponse {
                content: "ok".into(),
                token_usage: TokenUsage { prompt: 10, completion: 5 },
                latency: Duration::from_millis(1),
            })
        }

        async fn health(&self) -> Result<Duration, ProviderError> {
            Ok(Duration::from_millis(1))
        }
    }

    fn member() -> CouncilMember {
        CouncilMember {
            id: "m1".into(),
            provider: "flaky".into(),
            model: "x".into(),
            version: None,
            weight: None,
            timeout_seconds: 5,
            retry_policy: crate::types::RetryPolicy {
                max_attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 10,
                backoff_multiplier: 2.0,
                retryable_error_codes: std::collections::BTreeSet::from([crate::types::ErrorCode::RateLimit]),
            },
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_retryable_failures() {
        let mut pool = ProviderPool::new();
        pool.register(Arc::new(FlakyAdapter {
            attempts: AtomicU32::new(0),
            fail_until: 2,
            retry_after_ms: Mutex::new(None),
        }));
        let prompt = ProviderPrompt { query: "hi".into(), context: vec![] };
        let response = pool.call(&member(), &prompt).await.unwrap();
        assert_eq!(response.content, "ok");
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let mut pool = ProviderPool::new();
        pool.register(Arc::new(FlakyAdapter {
            attempts: AtomicU32::new(0),
            fail_until: 10,
            retry_after_ms: Mutex::new(None),
        }));
        let prompt = ProviderPrompt { query: "hi".into(), context: vec![] };
        let err = pool.call(&member(), &prompt).await.unwrap_err();
        assert!(matches!(err, ProviderError::RateLimit { .. }));
    }

    #[tokio::test]
    async fn missing_adapter_is_unknown_error() {
        let pool = ProviderPool::new();
        let mut m = member();
        m.provider = "nonexistent".into();
        let prompt = ProviderPrompt { query: "hi".into(), context: vec![] };
        let err = pool.call(&m, &prompt).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unknown { .. }));
    }
}
