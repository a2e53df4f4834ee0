//! Core data model: the entities named in the system's request pipeline.
//!
//! Fields mirror the semantic model rather than any particular wire format
//! — the HTTP gateway that (de)serializes these for clients is out of scope.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user-submitted query to run through the council.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRequest {
    pub id: String,
    pub query: String,
    pub session_id: Option<String>,
    pub conversation_context: Option<ConversationContext>,
    pub timestamp: DateTime<Utc>,
}

impl UserRequest {
    /// Construct a new request with a freshly generated id and the current timestamp.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            query: query.into(),
            session_id: None,
            conversation_context: None,
            timestamp: Utc::now(),
        }
    }
}

/// Prior turns in a conversation, plus an approximate token count for budgeting.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConversationContext {
    pub turns: Vec<ConversationTurn>,
    pub approximate_token_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// A configured `(provider, model)` endpoint participating in a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilMember {
    pub id: String,
    pub provider: String,
    pub model: String,
    pub version: Option<String>,
    pub weight: Option<f64>,
    pub timeout_seconds: u32,
    pub retry_policy: RetryPolicy,
}

impl CouncilMember {
    /// Per-call timeout as a [`std::time::Duration`], matching §5's
    /// `timeoutSeconds * 1000` millisecond conversion invariant.
    #[must_use]
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.timeout_seconds))
    }
}

/// Retry behavior for a single council member's outbound calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub retryable_error_codes: BTreeSet<ErrorCode>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            retryable_error_codes: BTreeSet::from([
                ErrorCode::RateLimit,
                ErrorCode::ServiceUnavailable,
                ErrorCode::Timeout,
                ErrorCode::NetworkError,
            ]),
        }
    }
}

/// Classification of an adapter-surfaced failure, used to decide retryability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthError,
    RateLimit,
    ServiceUnavailable,
    Timeout,
    NetworkError,
    Unknown,
}

/// Token usage for a single provider response.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u32,
    pub completion: u32,
}

impl TokenUsage {
    #[must_use]
    pub fn total(&self) -> u32 {
        self.prompt + self.completion
    }
}

/// A single council member's reply in round 0 (the initial fan-out).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialResponse {
    pub member_id: String,
    pub content: String,
    pub token_usage: TokenUsage,
    pub latency: std::time::Duration,
    pub timestamp: DateTime<Utc>,
}

/// A single council member's reply in a deliberation round ≥ 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    pub member_id: String,
    pub content: String,
    pub token_usage: TokenUsage,
    pub latency: std::time::Duration,
    pub timestamp: DateTime<Utc>,
    pub round_number: u32,
    pub references_to: BTreeSet<String>,
}

impl Exchange {
    /// Build an Exchange from a round-0 [`InitialResponse`], the canonical
    /// "round 0 is the initial fan-out" equivalence from the glossary.
    #[must_use]
    pub fn from_initial(resp: InitialResponse) -> Self {
        Self {
            member_id: resp.member_id,
            content: resp.content,
            token_usage: resp.token_usage,
            latency: resp.latency,
            timestamp: resp.timestamp,
            round_number: 0,
            references_to: BTreeSet::new(),
        }
    }
}

/// One round of a [`DeliberationThread`]: all exchanges produced in that round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliberationRound {
    pub round_number: u32,
    pub exchanges: Vec<Exchange>,
}

impl DeliberationRound {
    /// Exchanges sorted by timestamp ascending, per the persisted-ordering invariant.
    #[must_use]
    pub fn sorted_exchanges(&self) -> Vec<Exchange> {
        let mut exchanges = self.exchanges.clone();
        exchanges.sort_by_key(|e| e.timestamp);
        exchanges
    }
}

/// A full deliberation, ordered by increasing `round_number` starting at 0.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliberationThread {
    pub rounds: Vec<DeliberationRound>,
}

impl DeliberationThread {
    /// All exchanges across all rounds, in persisted order (round asc, then timestamp asc).
    #[must_use]
    pub fn all_exchanges(&self) -> Vec<Exchange> {
        let mut rounds = self.rounds.clone();
        rounds.sort_by_key(|r| r.round_number);
        rounds.into_iter().flat_map(|r| r.sorted_exchanges()).collect()
    }

    /// Exchanges belonging to the most recent round, or empty if no rounds exist.
    #[must_use]
    pub fn latest_round_exchanges(&self) -> Vec<Exchange> {
        self.rounds
            .iter()
            .max_by_key(|r| r.round_number)
            .map(DeliberationRound::sorted_exchanges)
            .unwrap_or_default()
    }
}

/// Confidence bucket for a [`ConsensusDecision`], driven by `agreement_level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    /// Derive confidence from an agreement level per the invariant:
    /// `= 1` implies high, `< 0.5` implies low, otherwise medium.
    #[must_use]
    pub fn from_agreement_level(agreement_level: f64) -> Self {
        if agreement_level >= 1.0 {
            Self::High
        } else if agreement_level < 0.5 {
            Self::Low
        } else {
            Self::Medium
        }
    }
}

/// Which strategy produced a [`ConsensusDecision`], and (for iterative
/// consensus) why it terminated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum SynthesisStrategy {
    ConsensusExtraction,
    WeightedFusion,
    MetaSynthesis,
    IterativeConsensus { fallback_reason: Option<FallbackReason> },
}

/// Why the iterative consensus synthesizer fell back to a non-negotiated decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    Deadlock,
    Exhaustion,
    EmbeddingFailure,
}

/// The synthesized output of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusDecision {
    pub content: String,
    pub confidence: Confidence,
    pub agreement_level: f64,
    pub synthesis_strategy: SynthesisStrategy,
    pub contributing_members: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// A member's output in a negotiation round, the unit over which similarity is measured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationResponse {
    pub member_id: String,
    pub content: String,
    pub round_number: u32,
    pub token_count: u32,
}

/// Monetary limits for a `(provider, model?)` scope. `model = None` means provider-wide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetCap {
    pub provider_id: String,
    pub model_id: Option<String>,
    pub daily_limit: Option<f64>,
    pub weekly_limit: Option<f64>,
    pub monthly_limit: Option<f64>,
}

/// Which calendar period a [`BudgetSpending`] row accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    Daily,
    Weekly,
    Monthly,
}

impl std::fmt::Display for PeriodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        };
        f.write_str(s)
    }
}

/// A single accounting row for one `(provider, model?, periodType)` scope,
/// valid over `[period_start, period_end)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSpending {
    pub provider_id: String,
    pub model_id: Option<String>,
    pub period_type: PeriodType,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub current_spend: f64,
    pub disabled: bool,
}

impl BudgetSpending {
    /// Whether `now` falls inside this row's active window (`start <= now < end`).
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.period_start <= now && now < self.period_end
    }
}

/// Terminal/in-progress state of an [`IdempotencyRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    InProgress,
    Completed,
    Failed,
}

/// Error payload cached under a failed idempotency record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: String,
    pub message: String,
}

/// A single coordination record for one idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub request_id: String,
    pub status: IdempotencyStatus,
    pub decision: Option<ConsensusDecision>,
    pub error_response: Option<ErrorResponse>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of [`crate::idempotency::CoordinationCache::check_key`].
#[derive(Debug, Clone)]
pub enum CacheLookup {
    NotFound,
    InProgress { request_id: String },
    Completed { request_id: String, decision: ConsensusDecision },
    Failed { request_id: String, error_response: ErrorResponse },
}

/// The declared type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    /// Whether a JSON value's runtime shape matches this declared type.
    #[must_use]
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }

    /// A lowercase label describing the runtime type of a value, for error messages.
    #[must_use]
    pub fn describe(value: &serde_json::Value) -> &'static str {
        match value {
            serde_json::Value::Null => "null",
            serde_json::Value::Bool(_) => "boolean",
            serde_json::Value::Number(_) => "number",
            serde_json::Value::String(_) => "string",
            serde_json::Value::Array(_) => "array",
            serde_json::Value::Object(_) => "object",
        }
    }
}

/// One parameter in a [`ToolDefinition`]'s schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    pub param_type: ParamType,
    pub required: bool,
    pub default: Option<serde_json::Value>,
}

/// Which execution backend a tool is routed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolAdapterKind {
    Function,
    Http,
}

/// A registered, callable tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
    pub adapter: ToolAdapterKind,
    /// For `Http` adapters, the endpoint params are POSTed to as JSON.
    pub endpoint: Option<String>,
}

/// A council member's request to invoke a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub params: serde_json::Value,
    pub member_id: String,
    pub request_id: String,
}

/// The outcome of executing a [`ToolCall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub latency: std::time::Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_boundaries() {
        assert_eq!(Confidence::from_agreement_level(1.0), Confidence::High);
        assert_eq!(Confidence::from_agreement_level(0.999), Confidence::Medium);
        assert_eq!(Confidence::from_agreement_level(0.5), Confidence::Medium);
        assert_eq!(Confidence::from_agreement_level(0.4999), Confidence::Low);
        assert_eq!(Confidence::from_agreement_level(0.0), Confidence::Low);
    }

    #[test]
    fn budget_spending_active_window_is_half_open() {
        let start = Utc::now();
        let end = start + chrono::Duration::hours(1);
        let row = BudgetSpending {
            provider_id: "openai".into(),
            model_id: None,
            period_type: PeriodType::Daily,
            period_start: start,
            period_end: end,
            current_spend: 0.0,
            disabled: false,
        };
        assert!(row.is_active_at(start));
        assert!(!row.is_active_at(end));
        assert!(row.is_active_at(end - chrono::Duration::seconds(1)));
    }

    #[test]
    fn deliberation_thread_orders_rounds_and_exchanges() {
        let mk = |round: u32, member: &str, secs_offset: i64| Exchange {
            member_id: member.into(),
            content: String::new(),
            token_usage: TokenUsage::default(),
            latency: std::time::Duration::from_millis(0),
            timestamp: Utc::now() + chrono::Duration::seconds(secs_offset),
            round_number: round,
            references_to: BTreeSet::new(),
        };
        let thread = DeliberationThread {
            rounds: vec![
                DeliberationRound {
                    round_number: 1,
                    exchanges: vec![mk(1, "b", 2), mk(1, "a", 1)],
                },
                DeliberationRound {
                    round_number: 0,
                    exchanges: vec![mk(0, "a", 1), mk(0, "b", 2)],
                },
            ],
        };
        let all = thread.all_exchanges();
        let round_numbers: Vec<_> = all.iter().map(|e| e.round_number).collect();
        assert_eq!(round_numbers, vec![0, 0, 1, 1]);
        // within round 1, "a" (earlier timestamp) should sort before "b"
        let round1: Vec<_> = all.iter().filter(|e| e.round_number == 1).map(|e| e.member_id.clone()).collect();
        assert_eq!(round1, vec!["a", "b"]);
    }

    #[test]
    fn param_type_matches_runtime_json_shapes() {
        assert!(ParamType::String.matches(&serde_json::json!("x")));
        assert!(!ParamType::String.matches(&serde_json::json!(1)));
        assert!(ParamType::Number.matches(&serde_json::json!(1.5)));
        assert!(ParamType::Array.matches(&serde_json::json!([1, 2])));
        assert_eq!(ParamType::describe(&serde_json::json!(1)), "number");
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: `from_agreement_level` always lands on exactly one
            /// of the three confidence tiers, and is monotonic with its input
            /// (never reports lower confidence for a higher agreement level).
            #[test]
            fn prop_confidence_is_monotonic_in_agreement_level(a in 0.0f64..1.5, b in 0.0f64..1.5) {
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                let rank = |c: Confidence| match c {
                    Confidence::Low => 0,
                    Confidence::Medium => 1,
                    Confidence::High => 2,
                };
                prop_assert!(rank(Confidence::from_agreement_level(lo)) <= rank(Confidence::from_agreement_level(hi)));
            }
        }
    }
}
