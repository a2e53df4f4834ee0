//! Error types for the council proxy core.
//!
//! Each concern gets its own `thiserror` enum; [`Error`] composes them into
//! the single type the orchestrator's public entry point returns.

use thiserror::Error;

use crate::types::{ErrorCode, PeriodType};

/// Errors raised while classifying or executing a single outbound provider call.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// Adapter returned 401/403, or the provider otherwise rejected credentials.
    #[error("authentication failed for provider {provider}: {message}")]
    AuthError { provider: String, message: String },

    /// Adapter returned 429 or an error mentioning "rate limit".
    #[error("rate limited by provider {provider}: {message}")]
    RateLimit {
        provider: String,
        message: String,
        /// Parsed `Retry-After` hint, in milliseconds, if one was present.
        retry_after_ms: Option<u64>,
    },

    /// Adapter returned 503 or "service unavailable".
    #[error("provider {provider} unavailable: {message}")]
    ServiceUnavailable { provider: String, message: String },

    /// The per-call deadline elapsed before the adapter returned.
    #[error("call to provider {provider} timed out after {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },

    /// Transport-level failure (connection reset, DNS failure, etc).
    #[error("network error calling provider {provider}: {message}")]
    NetworkError { provider: String, message: String },

    /// Anything that doesn't classify into one of the above kinds.
    #[error("unknown error calling provider {provider}: {message}")]
    Unknown { provider: String, message: String },
}

impl ProviderError {
    /// The [`ErrorCode`] this error classifies as, used by the retry loop
    /// to decide whether an attempt is retryable.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AuthError { .. } => ErrorCode::AuthError,
            Self::RateLimit { .. } => ErrorCode::RateLimit,
            Self::ServiceUnavailable { .. } => ErrorCode::ServiceUnavailable,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::NetworkError { .. } => ErrorCode::NetworkError,
            Self::Unknown { .. } => ErrorCode::Unknown,
        }
    }

    /// The provider this error originated from.
    #[must_use]
    pub fn provider(&self) -> &str {
        match self {
            Self::AuthError { provider, .. }
            | Self::RateLimit { provider, .. }
            | Self::ServiceUnavailable { provider, .. }
            | Self::Timeout { provider, .. }
            | Self::NetworkError { provider, .. }
            | Self::Unknown { provider, .. } => provider,
        }
    }
}

/// Errors from the idempotency cache's atomic-coordination surface.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum IdempotencyError {
    /// `markInProgress` found an existing record for the key.
    #[error("idempotency key {key} already has an in-flight or terminal record")]
    KeyAlreadyExists { key: String },

    /// `waitForCompletion` observed the key vanish before reaching a terminal state.
    #[error("idempotency key {key} was removed from the cache before completion")]
    RequestNoLongerInCache { key: String },

    /// `waitForCompletion` exceeded its caller-supplied timeout.
    #[error("timed out after {timeout_ms}ms waiting for key {key} to complete")]
    WaitTimeout { key: String, timeout_ms: u64 },

    /// The configured backend (e.g. Redis) failed to serve the request.
    #[error("idempotency backend error: {0}")]
    Backend(String),
}

/// Errors from budget pre-admission checks and spend accounting.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum BudgetError {
    /// `checkBudget` found the estimated cost would exceed an active cap.
    #[error("would exceed {period} budget cap of {limit} for {provider}{model_suffix}")]
    Exceeded {
        provider: String,
        model: Option<String>,
        period: PeriodType,
        limit: f64,
        model_suffix: String,
    },

    /// The configured backend (e.g. Postgres) failed to serve the request.
    #[error("budget backend error: {0}")]
    Backend(String),
}

impl BudgetError {
    /// Build an `Exceeded` variant, computing the `model_suffix` display helper.
    #[must_use]
    pub fn exceeded(
        provider: impl Into<String>,
        model: Option<String>,
        period: PeriodType,
        limit: f64,
    ) -> Self {
        let model_suffix = model
            .as_ref()
            .map(|m| format!("/{m}"))
            .unwrap_or_default();
        Self::Exceeded {
            provider: provider.into(),
            model,
            period,
            limit,
            model_suffix,
        }
    }
}

/// Errors from tool parameter validation and tool adapter execution.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ToolError {
    /// No tool is registered under the requested name.
    #[error("no tool registered with name {name}")]
    NotFound { name: String },

    /// A required parameter was missing from the call.
    #[error("missing required parameter {param} for tool {tool}")]
    MissingParameter { tool: String, param: String },

    /// A present parameter's runtime type did not match its declared type.
    #[error("parameter {param} for tool {tool} has the wrong type: expected {expected}, got {actual}")]
    TypeMismatch {
        tool: String,
        param: String,
        expected: String,
        actual: String,
    },

    /// The tool's per-call deadline elapsed.
    #[error("tool {tool} timed out")]
    Timeout { tool: String },

    /// The adapter itself failed (non-2xx HTTP status, function panic surfaced as error, etc).
    #[error("tool {tool} execution failed: {message}")]
    ExecutionFailed { tool: String, message: String },
}

/// Errors surfaced by the orchestrator's state machine.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// Every admitted member's request failed or timed out.
    #[error("no council member produced a usable response")]
    NoSurvivors,

    /// Fewer than `minimumSize` members survived admission and
    /// `requireMinimumForConsensus` is set.
    #[error("only {survivors} of the required {minimum} council members are available")]
    InsufficientCouncil { survivors: usize, minimum: usize },

    /// The global deadline elapsed before synthesis completed.
    #[error("request exceeded the global deadline of {deadline_secs}s")]
    TimedOut { deadline_secs: u64 },

    /// `markInProgress` raced with another requester holding the same key.
    #[error(transparent)]
    IdempotencyConflict(#[from] IdempotencyError),

    /// A council member's configured or estimated cost would exceed its budget.
    #[error(transparent)]
    Budget(#[from] BudgetError),

    /// A tool invoked mid-deliberation failed in a way that aborts the request.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// A provider call failed in a way that aborts the request (vs. being absorbed).
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Request or configuration input failed validation.
    #[error("validation error on field {field}: {message}")]
    Validation { field: String, message: String },
}

/// Top-level error type for `council-core`, composing the per-concern enums.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("embedding service failure: {0}")]
    EmbeddingFailure(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Convenience result alias used throughout `council-core`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_code_classification() {
        let e = ProviderError::RateLimit {
            provider: "openai".into(),
            message: "too many requests".into(),
            retry_after_ms: Some(2000),
        };
        assert_eq!(e.code(), ErrorCode::RateLimit);
        assert_eq!(e.provider(), "openai");
    }

    #[test]
    fn budget_exceeded_display_includes_model() {
        let e = BudgetError::exceeded("openai", Some("gpt-4".to_string()), PeriodType::Daily, 100.0);
        let msg = e.to_string();
        assert!(msg.contains("daily"));
        assert!(msg.contains("gpt-4"));
        assert!(msg.contains("100"));
    }

    #[test]
    fn budget_exceeded_display_omits_suffix_when_model_agnostic() {
        let e = BudgetError::exceeded("openai", None, PeriodType::Monthly, 500.0);
        assert_eq!(
            e.to_string(),
            "would exceed monthly budget cap of 500 for openai"
        );
    }

    #[test]
    fn orchestrator_error_wraps_idempotency_error() {
        let inner = IdempotencyError::KeyAlreadyExists { key: "k1".into() };
        let outer: OrchestratorError = inner.into();
        assert!(outer.to_string().contains("k1"));
    }

    #[test]
    fn top_level_error_wraps_orchestrator_error() {
        let inner = OrchestratorError::NoSurvivors;
        let outer: Error = inner.into();
        assert!(matches!(outer, Error::Orchestrator(OrchestratorError::NoSurvivors)));
    }
}
