//! Fleet health and rate-limit bookkeeping for the provider pool.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::ProviderError;

/// EWMA smoothing factor applied to each success/failure observation.
const SUCCESS_RATE_SMOOTHING: f64 = 0.2;
const DEGRADED_SUCCESS_RATE: f64 = 0.9;
const DEGRADED_CONSECUTIVE_FAILURES: u32 = 3;
const DISABLED_CONSECUTIVE_FAILURES: u32 = 10;
/// Fraction of calls allowed through to a disabled provider, for recovery probing.
const DISABLED_PROBE_RATE: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            success_rate: 1.0,
            avg_latency_ms: 0.0,
            consecutive_failures: 0,
            last_failure: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RateLimitStatus {
    pub is_rate_limited: bool,
    pub retry_after_ms: Option<u64>,
    pub last_rate_limit_time: Option<DateTime<Utc>>,
    pub count: u32,
}

struct ProviderState {
    health: ProviderHealth,
    rate_limit: RateLimitStatus,
    calls_since_disabled: u32,
}

impl Default for ProviderState {
    fn default() -> Self {
        Self {
            health: ProviderHealth::default(),
            rate_limit: RateLimitStatus::default(),
            calls_since_disabled: 0,
        }
    }
}

/// Tracks per-provider health and rate-limit state across the pool's lifetime.
///
/// `DashMap`-backed rather than `Mutex`-wrapped, matching the teacher's use
/// of `dashmap` for shared in-memory maps touched from many concurrent tasks.
pub struct HealthRegistry {
    state: DashMap<String, ProviderState>,
}

impl HealthRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { state: DashMap::new() }
    }

    #[must_use]
    pub fn snapshot(&self, provider: &str) -> ProviderHealth {
        self.state.get(provider).map(|s| s.health.clone()).unwrap_or_default()
    }

    /// Whether a call to a disabled provider should be let through as a recovery probe.
    #[must_use]
    pub fn should_probe(&self, provider: &str) -> bool {
        let mut entry = self.state.entry(provider.to_string()).or_default();
        if entry.health.status != HealthStatus::Disabled {
            return true;
        }
        entry.calls_since_disabled += 1;
        entry.calls_since_disabled % DISABLED_PROBE_RATE == 0
    }

    pub fn record_success(&self, provider: &str, latency: Duration) {
        let mut entry = self.state.entry(provider.to_string()).or_default();
        entry.health.success_rate += SUCCESS_RATE_SMOOTHING * (1.0 - entry.health.success_rate);
        entry.health.avg_latency_ms +=
            SUCCESS_RATE_SMOOTHING * (latency.as_millis() as f64 - entry.health.avg_latency_ms);
        entry.health.consecutive_failures = 0;
        entry.calls_since_disabled = 0;
        entry.health.status = HealthStatus::Healthy;
        if entry.rate_limit.is_rate_limited {
            entry.rate_limit.is_rate_limited = false;
        }
    }

    pub fn record_failure(&self, provider: &str, err: &ProviderError) {
        let mut entry = self.state.entry(provider.to_string()).or_default();
        entry.health.success_rate += SUCCESS_RATE_SMOOTHING * (0.0 - entry.health.success_rate);
        entry.health.consecutive_failures += 1;
        entry.health.last_failure = Some(Utc::now());

        entry.health.status = if entry.health.consecutive_failures >= DISABLED_CONSECUTIVE_FAILURES {
            HealthStatus::Disabled
        } else if entry.health.consecutive_failures >= DEGRADED_CONSECUTIVE_FAILURES
            || entry.health.success_rate < DEGRADED_SUCCESS_RATE
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        if let ProviderError::RateLimit { retry_after_ms, .. } = err {
            entry.rate_limit.is_rate_limited = true;
            entry.rate_limit.retry_after_ms = *retry_after_ms;
            entry.rate_limit.last_rate_limit_time = Some(Utc::now());
            entry.rate_limit.count += 1;
        }
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate_limit_err() -> ProviderError {
        ProviderError::RateLimit { provider: "p".into(), message: "slow down".into(), retry_after_ms: Some(1000) }
    }

    #[test]
    fn starts_healthy() {
        let reg = HealthRegistry::new();
        let snap = reg.snapshot("p");
        assert_eq!(snap.status, HealthStatus::Healthy);
        assert!((snap.success_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn degrades_after_three_consecutive_failures() {
        let reg = HealthRegistry::new();
        for _ in 0..3 {
            reg.record_failure("p", &rate_limit_err());
        }
        assert_eq!(reg.snapshot("p").status, HealthStatus::Degraded);
    }

    #[test]
    fn disables_after_ten_consecutive_failures() {
        let reg = HealthRegistry::new();
        for _ in 0..10 {
            reg.record_failure("p", &rate_limit_err());
        }
        assert_eq!(reg.snapshot("p").status, HealthStatus::Disabled);
    }

    #[test]
    fn recovers_to_healthy_on_success() {
        let reg = HealthRegistry::new();
        for _ in 0..5 {
            reg.record_failure("p", &rate_limit_err());
        }
        assert_eq!(reg.snapshot("p").status, HealthStatus::Degraded);
        reg.record_success("p", Duration::from_millis(20));
        assert_eq!(reg.snapshot("p").status, HealthStatus::Healthy);
        assert_eq!(reg.snapshot("p").consecutive_failures, 0);
    }

    #[test]
    fn tracks_rate_limit_status() {
        let reg = HealthRegistry::new();
        reg.record_failure("p", &rate_limit_err());
        let entry = reg.state.get("p").unwrap();
        let rl = &entry.rate_limit;
        assert!(rl.is_rate_limited);
        assert_eq!(rl.retry_after_ms, Some(1000));
        assert_eq!(rl.count, 1);
    }

    #[test]
    fn disabled_provider_allows_bounded_probe_rate() {
        let reg = HealthRegistry::new();
        for _ in 0..10 {
            reg.record_failure("p", &rate_limit_err());
        }
        assert_eq!(reg.snapshot("p").status, HealthStatus::Disabled);
        let mut allowed = 0;
        for _ in 0..20 {
            if reg.should_probe("p") {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 2);
    }
}
