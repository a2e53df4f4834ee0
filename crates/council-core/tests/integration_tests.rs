//! Black-box end-to-end tests of the `Orchestrator::execute` entry point,
//! driven through `council-testing`'s mock provider and embedding doubles
//! rather than the ad-hoc stubs the unit tests in `orchestrator.rs` use.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use council_core::audit::InMemoryAuditStore;
use council_core::budget::{BudgetEnforcer, BudgetStore, InMemoryBudgetStore};
use council_core::config::{
    CouncilConfig, DeliberationConfig, IterativeConsensusConfig, NegotiationMode, PerformanceConfig, RequestConfig,
    SynthesisConfig, SynthesisStrategyKind, TransparencyConfig,
};
use council_core::cost::Pricing;
use council_core::embeddings::{EmbeddingError, EmbeddingService};
use council_core::error::{Error, OrchestratorError, ProviderError};
use council_core::idempotency::InMemoryCoordinationCache;
use council_core::orchestrator::{FlatPricingCatalog, Orchestrator};
use council_core::provider::ProviderPool;
use council_core::types::{BudgetCap, CouncilMember, FallbackReason, RetryPolicy, SynthesisStrategy, UserRequest};
use council_testing::MockProviderAdapter;

type TestOrchestrator =
    Orchestrator<InMemoryCoordinationCache, InMemoryBudgetStore, MockEmbeddingStub, InMemoryAuditStore, FlatPricingCatalog>;

/// A content-keyed deterministic embedding double: identical strings embed
/// identically, and "agree"/"disagree" map to orthogonal vectors so
/// convergence and deadlock are reproducible without a real model.
struct MockEmbeddingStub;

#[async_trait]
impl EmbeddingService for MockEmbeddingStub {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.contains("disagree") {
            Ok(vec![0.0, 1.0])
        } else {
            Ok(vec![1.0, 0.0])
        }
    }
}

fn member(id: &str, provider: &str) -> CouncilMember {
    CouncilMember {
        id: id.into(),
        provider: provider.into(),
        model: "m".into(),
        version: None,
        weight: None,
        timeout_seconds: 5,
        retry_policy: RetryPolicy::default(),
    }
}

fn base_config(strategy: SynthesisStrategyKind, members: Vec<CouncilMember>) -> RequestConfig {
    RequestConfig {
        council: CouncilConfig { members, minimum_size: 1, require_minimum_for_consensus: false },
        deliberation: DeliberationConfig { rounds: 0 },
        synthesis: SynthesisConfig { strategy },
        performance: PerformanceConfig { global_timeout: 5 },
        transparency: TransparencyConfig { expose_exchanges: true },
        iterative_consensus: IterativeConsensusConfig::default(),
    }
}

fn build_orchestrator(pool: ProviderPool) -> TestOrchestrator {
    build_orchestrator_with_budget(pool, InMemoryBudgetStore::new())
}

fn build_orchestrator_with_budget(pool: ProviderPool, budget_store: InMemoryBudgetStore) -> TestOrchestrator {
    Orchestrator::new(
        Arc::new(InMemoryCoordinationCache::new()),
        BudgetEnforcer::new(budget_store),
        Arc::new(pool),
        Arc::new(MockEmbeddingStub),
        Arc::new(InMemoryAuditStore::new()),
        Arc::new(FlatPricingCatalog(Pricing { prompt_price_per_million: 1.0, completion_price_per_million: 1.0 })),
        None,
    )
}

/// Scenario 1: every council member responds in agreement; synthesis should
/// converge to a decision that cites every contributing member.
#[tokio::test]
async fn happy_path_consensus_across_a_three_member_council() {
    let mut pool = ProviderPool::new();
    pool.register(Arc::new(MockProviderAdapter::new("openai").with_response("the answer is 42")));
    pool.register(Arc::new(MockProviderAdapter::new("anthropic").with_response("the answer is 42")));
    pool.register(Arc::new(MockProviderAdapter::new("mistral").with_response("the answer is 42")));

    let members = vec![member("a", "openai"), member("b", "anthropic"), member("c", "mistral")];
    let orchestrator = build_orchestrator(pool);
    let config = base_config(SynthesisStrategyKind::ConsensusExtraction, members);
    let request = UserRequest::new("what is the answer?");

    let decision = orchestrator.execute(request, "happy-path-key", &config).await.unwrap();
    assert!(decision.content.contains("42"));
    assert_eq!(decision.contributing_members.len(), 3);
}

/// Scenario 2: a member whose provider has no remaining daily budget is
/// excluded at admission; when it was the only member, the request fails.
#[tokio::test]
async fn budget_denial_excludes_the_capped_provider_and_fails_with_no_survivors() {
    let mut pool = ProviderPool::new();
    pool.register(Arc::new(MockProviderAdapter::new("openai").with_response("answer")));

    let members = vec![member("a", "openai")];
    let budget_store = InMemoryBudgetStore::new();
    budget_store
        .put_cap(BudgetCap {
            provider_id: "openai".into(),
            model_id: Some("m".into()),
            daily_limit: Some(0.0),
            weekly_limit: None,
            monthly_limit: None,
        })
        .await;
    let orchestrator = build_orchestrator_with_budget(pool, budget_store);

    let config = base_config(SynthesisStrategyKind::ConsensusExtraction, members);
    let request = UserRequest::new("q");
    let err = orchestrator.execute(request, "budget-denial-key", &config).await.unwrap_err();
    assert!(matches!(err, Error::Orchestrator(OrchestratorError::NoSurvivors)));
}

/// Scenario 3: a second `execute` call under the same idempotency key
/// returns the cached decision and never re-invokes the provider.
#[tokio::test]
async fn idempotent_replay_does_not_recall_the_provider() {
    let adapter = Arc::new(MockProviderAdapter::new("openai").with_response("cached answer"));
    let mut pool = ProviderPool::new();
    pool.register(adapter.clone());

    let members = vec![member("a", "openai")];
    let orchestrator = build_orchestrator(pool);
    let config = base_config(SynthesisStrategyKind::ConsensusExtraction, members);
    let request = UserRequest::new("q");

    let first = orchestrator.execute(request.clone(), "replay-key", &config).await.unwrap();
    let calls_after_first = adapter.call_count();
    let second = orchestrator.execute(request, "replay-key", &config).await.unwrap();

    assert_eq!(first.content, second.content);
    assert_eq!(first.timestamp, second.timestamp);
    assert_eq!(adapter.call_count(), calls_after_first);
}

/// Scenario 4: two members that never converge drive the negotiator into
/// deadlock; it falls back to weighted fusion rather than looping forever.
#[tokio::test]
async fn iterative_negotiation_falls_back_on_deadlock() {
    let mut pool = ProviderPool::new();
    pool.register(Arc::new(MockProviderAdapter::new("openai").with_response("disagree with the premise")));
    pool.register(Arc::new(MockProviderAdapter::new("anthropic").with_response("agree with the premise")));

    let members = vec![member("a", "openai"), member("b", "anthropic")];
    let orchestrator = build_orchestrator(pool);
    let mut config = base_config(SynthesisStrategyKind::IterativeConsensus, members);
    config.iterative_consensus = IterativeConsensusConfig {
        max_rounds: 5,
        agreement_threshold: 0.85,
        deadlock_window: 3,
        deadlock_tolerance: 0.01,
        negotiation_mode: NegotiationMode::Parallel,
        embedding_model: "default".into(),
    };
    let request = UserRequest::new("q");

    let decision = orchestrator.execute(request, "deadlock-key", &config).await.unwrap();
    assert!(matches!(
        decision.synthesis_strategy,
        SynthesisStrategy::IterativeConsensus { fallback_reason: Some(FallbackReason::Deadlock) }
    ));
}

/// Scenario 5: a provider that fails once with a rate limit honors the
/// `Retry-After` hint and succeeds on the next attempt.
#[tokio::test]
async fn retry_after_rate_limit_recovers_on_next_attempt() {
    let adapter = Arc::new(MockProviderAdapter::new("openai").with_response("recovered answer"));
    adapter.fail_next_with(ProviderError::RateLimit {
        provider: "openai".into(),
        message: "slow down".into(),
        retry_after_ms: Some(20),
    });
    let mut pool = ProviderPool::new();
    pool.register(adapter.clone());

    let members = vec![member("a", "openai")];
    let orchestrator = build_orchestrator(pool);
    let config = base_config(SynthesisStrategyKind::ConsensusExtraction, members);
    let request = UserRequest::new("q");

    let decision = orchestrator.execute(request, "retry-key", &config).await.unwrap();
    assert_eq!(decision.content, "recovered answer");
    assert_eq!(adapter.call_count(), 2);
}

/// Scenario 6b: with `DeliberationConfig.rounds > 0` under a non-iterative
/// strategy, the orchestrator runs its own critique rounds before synthesis,
/// and prior conversation turns reach the first fan-out call.
#[tokio::test]
async fn deliberation_rounds_run_before_weighted_fusion_synthesis() {
    let mut pool = ProviderPool::new();
    pool.register(Arc::new(MockProviderAdapter::new("openai").with_response("42")));
    pool.register(Arc::new(MockProviderAdapter::new("anthropic").with_response("42")));

    let members = vec![member("a", "openai"), member("b", "anthropic")];
    let orchestrator = build_orchestrator(pool);
    let mut config = base_config(SynthesisStrategyKind::WeightedFusion, members);
    config.deliberation = DeliberationConfig { rounds: 2 };

    let mut request = UserRequest::new("what is the answer?");
    request.conversation_context = Some(council_core::types::ConversationContext {
        turns: vec![council_core::types::ConversationTurn {
            role: council_core::types::Role::User,
            content: "earlier turn".into(),
        }],
        approximate_token_count: 3,
    });

    let decision = orchestrator.execute(request, "deliberation-key", &config).await.unwrap();
    assert!(decision.content.contains("42"));
}

/// Scenario 6: a council member whose configured timeout is shorter than its
/// adapter's latency is excluded from the deliberation rather than stalling
/// the request.
#[tokio::test]
async fn slow_member_is_dropped_by_its_own_call_timeout() {
    let mut pool = ProviderPool::new();
    pool.register(Arc::new(
        MockProviderAdapter::new("openai").with_response("fast answer").with_latency(Duration::from_millis(5)),
    ));
    pool.register(Arc::new(
        MockProviderAdapter::new("anthropic").with_response("slow answer").with_latency(Duration::from_millis(200)),
    ));

    let mut slow = member("slow", "anthropic");
    slow.timeout_seconds = 0;
    slow.retry_policy.max_attempts = 1;
    let members = vec![member("fast", "openai"), slow];

    let orchestrator = build_orchestrator(pool);
    let config = base_config(SynthesisStrategyKind::ConsensusExtraction, members);
    let request = UserRequest::new("q");

    let decision = orchestrator.execute(request, "timeout-key", &config).await.unwrap();
    assert_eq!(decision.contributing_members, vec!["fast".to_string()]);
}
