//! The request state machine: `New -> Admitting -> Fanning-Out ->
//! (Deliberating)? -> Synthesizing -> Publishing -> Done|Failed|TimedOut`.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::audit::{AuditRecord, AuditStore};
use crate::budget::BudgetEnforcer;
use crate::budget::BudgetStore;
use crate::config::{RequestConfig, SynthesisStrategyKind};
use crate::cost::{aggregate_costs, calculate_cost, CostEntry, Pricing};
use crate::embeddings::EmbeddingService;
use crate::error::{Error, OrchestratorError};
use crate::idempotency::CoordinationCache;
use crate::provider::{ProviderPool, ProviderPrompt};
use crate::synthesis::{consensus, fusion, iterative, meta, prompt_template, MetaSynthesizer};
use crate::types::{
    ConsensusDecision, CouncilMember, DeliberationRound, DeliberationThread, ErrorResponse, Exchange,
    InitialResponse, NegotiationResponse, Role, SynthesisStrategy, UserRequest,
};

/// Per-member pricing lookup, used to estimate and later record spend.
pub trait PricingCatalog: Send + Sync {
    fn pricing_for(&self, provider: &str, model: &str) -> Pricing;
}

/// A fixed council-wide estimate, useful when per-token pricing isn't modeled.
pub struct FlatPricingCatalog(pub Pricing);

impl PricingCatalog for FlatPricingCatalog {
    fn pricing_for(&self, _provider: &str, _model: &str) -> Pricing {
        self.0
    }
}

/// Conservative token-count estimate used for the pre-admission budget
/// check, before the real usage is known.
const ESTIMATED_PROMPT_TOKENS: u32 = 500;
const ESTIMATED_COMPLETION_TOKENS: u32 = 500;

/// Wires together the idempotency cache, budget enforcer, provider pool,
/// synthesis strategies, and audit store behind the single `execute` entry
/// point a caller needs.
pub struct Orchestrator<C, B, E, A, P>
where
    C: CoordinationCache,
    B: BudgetStore,
    E: EmbeddingService,
    A: AuditStore,
    P: PricingCatalog,
{
    cache: Arc<C>,
    budget: BudgetEnforcer<B>,
    providers: Arc<ProviderPool>,
    embeddings: Arc<E>,
    audit: Arc<A>,
    pricing: Arc<P>,
    meta_synthesizer: Option<Arc<dyn MetaSynthesizer>>,
}

impl<C, B, E, A, P> Orchestrator<C, B, E, A, P>
where
    C: CoordinationCache,
    B: BudgetStore,
    E: EmbeddingService,
    A: AuditStore,
    P: PricingCatalog,
{
    pub fn new(
        cache: Arc<C>,
        budget: BudgetEnforcer<B>,
        providers: Arc<ProviderPool>,
        embeddings: Arc<E>,
        audit: Arc<A>,
        pricing: Arc<P>,
        meta_synthesizer: Option<Arc<dyn MetaSynthesizer>>,
    ) -> Self {
        Self { cache, budget, providers, embeddings, audit, pricing, meta_synthesizer }
    }

    /// Run a request through the full state machine, honoring `idempotency_key`.
    pub async fn execute(
        &self,
        request: UserRequest,
        idempotency_key: &str,
        config: &RequestConfig,
    ) -> Result<ConsensusDecision, Error> {
        // Admitting: idempotency gate.
        match self.cache.check_key(idempotency_key).await {
            crate::types::CacheLookup::Completed { decision, .. } => return Ok(decision),
            crate::types::CacheLookup::Failed { error_response, .. } => {
                return Err(Error::Orchestrator(OrchestratorError::Validation {
                    field: "idempotency_key".into(),
                    message: error_response.message,
                }))
            }
            crate::types::CacheLookup::InProgress { .. } => {
                match self.cache.wait_for_completion(idempotency_key, config.performance.global_timeout * 1000).await {
                    Ok(crate::types::CacheLookup::Completed { decision, .. }) => return Ok(decision),
                    Ok(crate::types::CacheLookup::Failed { error_response, .. }) => {
                        return Err(Error::Orchestrator(OrchestratorError::Validation {
                            field: "idempotency_key".into(),
                            message: error_response.message,
                        }))
                    }
                    _ => {
                        return Err(Error::Orchestrator(OrchestratorError::TimedOut {
                            deadline_secs: config.performance.global_timeout,
                        }))
                    }
                }
            }
            crate::types::CacheLookup::NotFound => {
                self.cache.mark_in_progress(idempotency_key, &request.id, crate::idempotency::DEFAULT_TTL_SECONDS).await?;
            }
        }

        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(config.performance.global_timeout),
            self.run_admitted(&request, config),
        )
        .await;

        match outcome {
            Ok(Ok(decision)) => {
                self.cache
                    .cache_result(idempotency_key, &request.id, decision.clone(), crate::idempotency::DEFAULT_TTL_SECONDS)
                    .await?;
                Ok(decision)
            }
            Ok(Err(err)) => {
                self.cache
                    .cache_error(
                        idempotency_key,
                        &request.id,
                        ErrorResponse { kind: "orchestrator_error".into(), message: err.to_string() },
                        crate::idempotency::DEFAULT_TTL_SECONDS,
                    )
                    .await?;
                Err(err)
            }
            Err(_) => {
                let timeout_err = Error::Orchestrator(OrchestratorError::TimedOut {
                    deadline_secs: config.performance.global_timeout,
                });
                self.cache
                    .cache_error(
                        idempotency_key,
                        &request.id,
                        ErrorResponse { kind: "timeout".into(), message: timeout_err.to_string() },
                        crate::idempotency::DEFAULT_TTL_SECONDS,
                    )
                    .await?;
                Err(timeout_err)
            }
        }
    }

    /// Admitting through Publishing, run under the caller's global deadline.
    async fn run_admitted(&self, request: &UserRequest, config: &RequestConfig) -> Result<ConsensusDecision, Error> {
        let survivors = self.admit(&config.council.members).await;
        if survivors.len() < config.council.minimum_size && config.council.require_minimum_for_consensus {
            return Err(Error::Orchestrator(OrchestratorError::InsufficientCouncil {
                survivors: survivors.len(),
                minimum: config.council.minimum_size,
            }));
        }

        let initial_responses = self.fan_out(&survivors, request).await;
        if initial_responses.is_empty() {
            return Err(Error::Orchestrator(OrchestratorError::NoSurvivors));
        }

        let mut thread = DeliberationThread::default();
        thread.rounds.push(DeliberationRound {
            round_number: 0,
            exchanges: initial_responses.iter().cloned().map(Exchange::from_initial).collect(),
        });

        let deliberates = config.deliberation.rounds > 0
            && config.synthesis.strategy != SynthesisStrategyKind::IterativeConsensus;
        let deliberated_responses = if deliberates {
            self.deliberate(&survivors, request, config, &mut thread).await
        } else {
            Vec::new()
        };
        let synthesis_input =
            if deliberated_responses.is_empty() { &initial_responses } else { &deliberated_responses };

        let decision = self.synthesize(&survivors, request, synthesis_input, config).await?;

        self.publish(request, &thread, &decision, &initial_responses, &survivors).await?;
        info!(request_id = %request.id, "request published");
        Ok(decision)
    }

    /// Deliberating: only entered when `DeliberationConfig.rounds > 0` and the
    /// configured synthesis strategy isn't iterative-consensus, which manages
    /// its own negotiation rounds internally. For each round, fans out a
    /// critique prompt to every still-alive member containing the prior
    /// round's exchanges with attribution, and collects one exchange per
    /// member. A member that fails in round `r` is dropped from subsequent
    /// rounds, but its earlier contributions remain in `thread`.
    ///
    /// Returns the final round's exchanges, reshaped as [`InitialResponse`]s
    /// for the downstream synthesis strategies. Empty if every member failed
    /// in the first deliberation round.
    async fn deliberate(
        &self,
        members: &[CouncilMember],
        request: &UserRequest,
        config: &RequestConfig,
        thread: &mut DeliberationThread,
    ) -> Vec<InitialResponse> {
        let mut alive: Vec<CouncilMember> = members.to_vec();
        let mut current: Vec<Exchange> = thread.latest_round_exchanges();

        for round_number in 1..=config.deliberation.rounds {
            if alive.is_empty() {
                break;
            }
            let negotiation_responses: Vec<NegotiationResponse> =
                current.iter().map(exchange_to_negotiation).collect();
            let prior_ids: std::collections::BTreeSet<String> =
                current.iter().map(|e| e.member_id.clone()).collect();
            let critique = prompt_template::build_negotiation_prompt(
                &request.query,
                &negotiation_responses,
                &[],
                &[],
                &[],
            );
            let prompt = ProviderPrompt { query: critique.clone(), context: vec![(Role::User, critique)] };

            let calls = alive.iter().map(|member| {
                let prompt = prompt.clone();
                let references_to = prior_ids.clone();
                async move {
                    let response = self.providers.call(member, &prompt).await.ok()?;
                    Some(Exchange {
                        member_id: member.id.clone(),
                        content: response.content,
                        token_usage: response.token_usage,
                        latency: response.latency,
                        timestamp: Utc::now(),
                        round_number,
                        references_to,
                    })
                }
            });
            let exchanges: Vec<Exchange> = futures::future::join_all(calls).await.into_iter().flatten().collect();
            if exchanges.is_empty() {
                break;
            }
            alive.retain(|m| exchanges.iter().any(|e| e.member_id == m.id));
            thread.rounds.push(DeliberationRound { round_number, exchanges: exchanges.clone() });
            current = exchanges;
        }

        current.iter().map(exchange_to_initial).collect()
    }

    /// Admitting: idempotency already gated by the caller; here we apply the
    /// per-member budget pre-check, excluding members whose estimated cost
    /// would exceed their budget.
    async fn admit(&self, members: &[CouncilMember]) -> Vec<CouncilMember> {
        let mut survivors = Vec::new();
        for member in members {
            let pricing = self.pricing.pricing_for(&member.provider, &member.model);
            let estimate = calculate_cost(
                crate::types::TokenUsage { prompt: ESTIMATED_PROMPT_TOKENS, completion: ESTIMATED_COMPLETION_TOKENS },
                pricing,
            );
            let check = self.budget.check_budget(&member.provider, Some(member.model.as_str()), estimate).await;
            if check.allowed {
                survivors.push(member.clone());
            } else {
                warn!(member = %member.id, reason = ?check.reason, "excluded from council at admission");
            }
        }
        survivors
    }

    /// Fanning-Out: call every survivor concurrently under its own timeout/retry.
    /// Prior conversation turns, if any, are prepended to the context before
    /// the current query so members see the full exchange, not just this turn.
    async fn fan_out(&self, members: &[CouncilMember], request: &UserRequest) -> Vec<InitialResponse> {
        let mut context: Vec<(Role, String)> = request
            .conversation_context
            .as_ref()
            .map(|ctx| ctx.turns.iter().map(|t| (t.role, t.content.clone())).collect())
            .unwrap_or_default();
        context.push((Role::User, request.query.clone()));
        let prompt = ProviderPrompt { query: request.query.clone(), context };
        let calls = members.iter().map(|member| {
            let prompt = prompt.clone();
            async move {
                let response = self.providers.call(member, &prompt).await.ok()?;
                Some(InitialResponse {
                    member_id: member.id.clone(),
                    content: response.content,
                    token_usage: response.token_usage,
                    latency: response.latency,
                    timestamp: Utc::now(),
                })
            }
        });
        futures::future::join_all(calls).await.into_iter().flatten().collect()
    }

    /// Synthesizing: dispatch to the configured strategy.
    async fn synthesize(
        &self,
        members: &[CouncilMember],
        request: &UserRequest,
        initial_responses: &[InitialResponse],
        config: &RequestConfig,
    ) -> Result<ConsensusDecision, Error> {
        match config.synthesis.strategy {
            SynthesisStrategyKind::IterativeConsensus => Ok(iterative::negotiate(
                self.embeddings.as_ref(),
                &self.providers,
                members,
                &request.query,
                initial_responses,
                &config.iterative_consensus,
            )
            .await),
            SynthesisStrategyKind::ConsensusExtraction => {
                consensus::extract_consensus(self.embeddings.as_ref(), initial_responses, config.iterative_consensus.agreement_threshold)
                    .await
                    .map_err(|e| Error::EmbeddingFailure(e.to_string()))
            }
            SynthesisStrategyKind::WeightedFusion => {
                let negotiation_responses: Vec<_> = initial_responses
                    .iter()
                    .map(|r| crate::types::NegotiationResponse {
                        member_id: r.member_id.clone(),
                        content: r.content.clone(),
                        round_number: 0,
                        token_count: r.token_usage.total(),
                    })
                    .collect();
                fusion::weighted_fusion_decision(
                    &negotiation_responses,
                    members,
                    1.0,
                    SynthesisStrategy::WeightedFusion,
                )
                .ok_or_else(|| Error::Orchestrator(OrchestratorError::NoSurvivors))
            }
            SynthesisStrategyKind::MetaSynthesis => match &self.meta_synthesizer {
                Some(judge) => meta::synthesize(judge.as_ref(), &request.query, initial_responses)
                    .await
                    .map_err(|e| Error::Configuration(e.to_string())),
                None => Err(Error::Configuration(
                    "meta_synthesis strategy requires a MetaSynthesizer wired in by the caller".to_string(),
                )),
            },
        }
    }

    /// Publishing: record spend, persist the audit row, and surface the result.
    async fn publish(
        &self,
        request: &UserRequest,
        thread: &DeliberationThread,
        decision: &ConsensusDecision,
        initial_responses: &[InitialResponse],
        members: &[CouncilMember],
    ) -> Result<(), Error> {
        let mut costs = Vec::new();
        for response in initial_responses {
            if !decision.contributing_members.contains(&response.member_id) {
                continue;
            }
            let Some(member) = members.iter().find(|m| m.id == response.member_id) else {
                continue;
            };
            let pricing = self.pricing.pricing_for(&member.provider, &member.model);
            let cost = calculate_cost(response.token_usage, pricing);
            self.budget.record_spending(&member.provider, Some(member.model.as_str()), cost).await?;
            costs.push(CostEntry { provider: member.provider.clone(), member_id: member.id.clone(), cost });
        }
        let _summary = aggregate_costs(&costs);

        self.audit
            .record(AuditRecord {
                request: request.clone(),
                deliberation: thread.clone(),
                decision: decision.clone(),
                costs,
                recorded_at: Utc::now(),
            })
            .await
            .map_err(|e| Error::Configuration(e.to_string()))?;
        Ok(())
    }
}

fn exchange_to_negotiation(exchange: &Exchange) -> NegotiationResponse {
    NegotiationResponse {
        member_id: exchange.member_id.clone(),
        content: exchange.content.clone(),
        round_number: exchange.round_number,
        token_count: exchange.token_usage.total(),
    }
}

fn exchange_to_initial(exchange: &Exchange) -> InitialResponse {
    InitialResponse {
        member_id: exchange.member_id.clone(),
        content: exchange.content.clone(),
        token_usage: exchange.token_usage,
        latency: exchange.latency,
        timestamp: exchange.timestamp,
    }
}
