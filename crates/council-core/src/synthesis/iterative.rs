//! The iterative consensus synthesizer: negotiation rounds, convergence and
//! deadlock detection, and the fallback chain when negotiation does not
//! converge.

use std::collections::{HashSet, VecDeque};

use chrono::Utc;

use crate::config::{IterativeConsensusConfig, NegotiationMode};
use crate::embeddings::EmbeddingService;
use crate::provider::{ProviderPool, ProviderPrompt};
use crate::types::{
    Confidence, ConsensusDecision, CouncilMember, FallbackReason, InitialResponse, NegotiationResponse,
    Role, SynthesisStrategy,
};

use super::fusion::weighted_fusion_decision;
use super::prompt_template::build_negotiation_prompt;
use super::similarity::SimilarityMatrix;

const DISAGREEMENT_THRESHOLD: f64 = 0.7;
const MIN_TOKEN_LEN: usize = 3;
const MAX_DISAGREEMENT_TERMS: usize = 3;

/// Run the full negotiation loop to termination, returning the resulting
/// [`ConsensusDecision`] whether by convergence or fallback.
pub async fn negotiate<E: EmbeddingService>(
    embeddings: &E,
    pool: &ProviderPool,
    members: &[CouncilMember],
    query: &str,
    initial_responses: &[InitialResponse],
    config: &IterativeConsensusConfig,
) -> ConsensusDecision {
    let mut survivors: Vec<CouncilMember> =
        members.iter().filter(|m| initial_responses.iter().any(|r| r.member_id == m.id)).cloned().collect();

    let mut current: Vec<NegotiationResponse> = initial_responses
        .iter()
        .map(|r| NegotiationResponse {
            member_id: r.member_id.clone(),
            content: r.content.clone(),
            round_number: 0,
            token_count: r.token_usage.total(),
        })
        .collect();

    let mut avg_similarity_history: Vec<f64> = Vec::new();
    let mut last_non_empty = current.clone();

    for round in 1..=config.max_rounds {
        if survivors.is_empty() || current.is_empty() {
            return fallback_decision(&last_non_empty, members, FallbackReason::Exhaustion, 0.0);
        }

        let matrix = match embed_all(embeddings, &current).await {
            Ok(vectors) => SimilarityMatrix::build(&vectors),
            Err(_) => {
                return fallback_decision(&last_non_empty, members, FallbackReason::EmbeddingFailure, 0.0);
            }
        };

        let disagreements = identify_disagreements(&current, &matrix);
        let agreements = describe_agreement_groups(&current, &matrix, config.agreement_threshold);
        let examples: Vec<String> = disagreements.iter().take(2).cloned().collect();

        let round_responses = execute_round(
            pool,
            &survivors,
            query,
            &current,
            &disagreements,
            &agreements,
            &examples,
            round,
            config.negotiation_mode,
        )
        .await;

        let (succeeded, failed_ids): (Vec<_>, Vec<_>) = {
            let mut succeeded = Vec::new();
            let mut failed = Vec::new();
            for (member_id, outcome) in round_responses {
                match outcome {
                    Some(response) => succeeded.push(response),
                    None => failed.push(member_id),
                }
            }
            (succeeded, failed)
        };
        survivors.retain(|m| !failed_ids.contains(&m.id));

        if succeeded.is_empty() {
            return fallback_decision(&last_non_empty, members, FallbackReason::Exhaustion, 0.0);
        }

        let embedded = match embed_all(embeddings, &succeeded).await {
            Ok(vectors) => vectors,
            Err(_) => {
                return fallback_decision(&last_non_empty, members, FallbackReason::EmbeddingFailure, 0.0);
            }
        };
        let round_matrix = SimilarityMatrix::build(&embedded);
        let avg = round_matrix.average();
        avg_similarity_history.push(avg);

        current = succeeded;
        last_non_empty = current.clone();

        if round_matrix.all_pairs_converged(config.agreement_threshold) {
            return converged_decision(&current, &round_matrix, avg);
        }

        if is_deadlocked(&avg_similarity_history, config.deadlock_window, config.deadlock_tolerance, config.agreement_threshold)
        {
            return fallback_decision(&current, members, FallbackReason::Deadlock, avg);
        }

        if round == config.max_rounds {
            return fallback_decision(&current, members, FallbackReason::Exhaustion, avg);
        }
    }

    fallback_decision(&last_non_empty, members, FallbackReason::Exhaustion, 0.0)
}

async fn embed_all<E: EmbeddingService>(
    embeddings: &E,
    responses: &[NegotiationResponse],
) -> Result<Vec<Vec<f32>>, crate::embeddings::EmbeddingError> {
    let mut out = Vec::with_capacity(responses.len());
    for r in responses {
        out.push(embeddings.embed(&r.content).await?);
    }
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
async fn execute_round(
    pool: &ProviderPool,
    survivors: &[CouncilMember],
    query: &str,
    prior: &[NegotiationResponse],
    disagreements: &[String],
    agreements: &[String],
    examples: &[String],
    round: u32,
    mode: NegotiationMode,
) -> Vec<(String, Option<NegotiationResponse>)> {
    let prompt_text = build_negotiation_prompt(query, prior, disagreements, agreements, examples);
    let prompt = ProviderPrompt { query: prompt_text, context: vec![(Role::User, query.to_string())] };

    let call = |member: &CouncilMember| {
        let prompt = prompt.clone();
        async move {
            let result = pool.call(member, &prompt).await;
            let response = result.ok().map(|r| NegotiationResponse {
                member_id: member.id.clone(),
                content: r.content,
                round_number: round,
                token_count: r.token_usage.total(),
            });
            (member.id.clone(), response)
        }
    };

    match mode {
        NegotiationMode::Parallel => {
            futures::future::join_all(survivors.iter().map(call)).await
        }
        NegotiationMode::Sequential => {
            let mut out = Vec::with_capacity(survivors.len());
            for member in survivors {
                out.push(call(member).await);
            }
            out
        }
    }
}

fn tokenize(content: &str) -> HashSet<String> {
    content
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > MIN_TOKEN_LEN)
        .map(|w| w.to_lowercase())
        .collect()
}

/// Pairs with similarity below [`DISAGREEMENT_THRESHOLD`], summarized by the
/// symmetric difference of their content tokens.
fn identify_disagreements(responses: &[NegotiationResponse], matrix: &SimilarityMatrix) -> Vec<String> {
    let mut out = Vec::new();
    let n = responses.len();
    for i in 0..n {
        for j in (i + 1)..n {
            if matrix.get(i, j) < DISAGREEMENT_THRESHOLD {
                let tokens_i = tokenize(&responses[i].content);
                let tokens_j = tokenize(&responses[j].content);
                let mut only_i: Vec<_> = tokens_i.difference(&tokens_j).cloned().collect();
                let mut only_j: Vec<_> = tokens_j.difference(&tokens_i).cloned().collect();
                only_i.sort();
                only_j.sort();
                only_i.truncate(MAX_DISAGREEMENT_TERMS);
                only_j.truncate(MAX_DISAGREEMENT_TERMS);
                out.push(format!(
                    "{} emphasizes [{}] while {} emphasizes [{}]",
                    responses[i].member_id,
                    only_i.join(", "),
                    responses[j].member_id,
                    only_j.join(", "),
                ));
            }
        }
    }
    out
}

pub(crate) struct AgreementGroup {
    pub(crate) members: Vec<String>,
    pub(crate) cohesion: f64,
}

/// Transitively-extended groups of indices whose pairwise similarity meets
/// `threshold`, partitioning responses by first-group-wins assignment.
pub(crate) fn extract_agreement_groups(responses: &[NegotiationResponse], matrix: &SimilarityMatrix, threshold: f64) -> Vec<AgreementGroup> {
    let n = responses.len();
    let mut assigned = vec![false; n];
    let mut groups = Vec::new();

    for seed in 0..n {
        if assigned[seed] {
            continue;
        }
        let mut group = vec![seed];
        assigned[seed] = true;
        let mut queue = VecDeque::from([seed]);
        while let Some(cur) = queue.pop_front() {
            for next in 0..n {
                if !assigned[next] && matrix.get(cur, next) >= threshold {
                    assigned[next] = true;
                    group.push(next);
                    queue.push_back(next);
                }
            }
        }
        if group.len() > 1 {
            let mut sum = 0.0;
            let mut count = 0usize;
            for a in 0..group.len() {
                for b in (a + 1)..group.len() {
                    sum += matrix.get(group[a], group[b]);
                    count += 1;
                }
            }
            let cohesion = if count > 0 { sum / count as f64 } else { 1.0 };
            groups.push(AgreementGroup {
                members: group.iter().map(|&idx| responses[idx].member_id.clone()).collect(),
                cohesion,
            });
        }
    }
    groups
}

fn describe_agreement_groups(responses: &[NegotiationResponse], matrix: &SimilarityMatrix, threshold: f64) -> Vec<String> {
    extract_agreement_groups(responses, matrix, threshold)
        .into_iter()
        .map(|g| format!("{} agree (cohesion {:.2})", g.members.join(", "), g.cohesion))
        .collect()
}

fn is_deadlocked(history: &[f64], window: usize, tolerance: f64, threshold: f64) -> bool {
    if history.len() < window {
        return false;
    }
    let recent = &history[history.len() - window..];
    let max = recent.iter().cloned().fold(f64::MIN, f64::max);
    let min = recent.iter().cloned().fold(f64::MAX, f64::min);
    let latest = *recent.last().expect("window is non-empty");
    (max - min) <= tolerance && latest < threshold
}

/// Build the final decision on convergence: content is the response with
/// the highest mean similarity to the rest of the converged set.
fn converged_decision(responses: &[NegotiationResponse], matrix: &SimilarityMatrix, avg: f64) -> ConsensusDecision {
    let n = responses.len();
    let best = (0..n)
        .max_by(|&a, &b| {
            let score = |idx: usize| -> f64 {
                if n <= 1 {
                    1.0
                } else {
                    (0..n).filter(|&o| o != idx).map(|o| matrix.get(idx, o)).sum::<f64>() / (n - 1) as f64
                }
            };
            score(a)
                .partial_cmp(&score(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(responses[b].member_id.cmp(&responses[a].member_id))
        })
        .unwrap_or(0);

    ConsensusDecision {
        content: responses[best].content.clone(),
        confidence: Confidence::High,
        agreement_level: avg,
        synthesis_strategy: SynthesisStrategy::IterativeConsensus { fallback_reason: None },
        contributing_members: responses.iter().map(|r| r.member_id.clone()).collect(),
        timestamp: Utc::now(),
    }
}

/// Fallback chain: weighted fusion first, single highest-cohesion response second.
fn fallback_decision(
    responses: &[NegotiationResponse],
    members: &[CouncilMember],
    reason: FallbackReason,
    agreement_level: f64,
) -> ConsensusDecision {
    let strategy = SynthesisStrategy::IterativeConsensus { fallback_reason: Some(reason) };
    if let Some(decision) = weighted_fusion_decision(responses, members, agreement_level, strategy) {
        return decision;
    }

    // Weighted fusion is unavailable only when there is nothing to fuse.
    ConsensusDecision {
        content: String::new(),
        confidence: Confidence::Low,
        agreement_level,
        synthesis_strategy: SynthesisStrategy::IterativeConsensus { fallback_reason: Some(reason) },
        contributing_members: Vec::new(),
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::EmbeddingError;
    use crate::provider::{ProviderAdapter, ProviderResponse};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    struct DeterministicEmbeddings;

    #[async_trait]
    impl EmbeddingService for DeterministicEmbeddings {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            // maps a small fixed vocabulary to orthogonal/near-identical vectors
            // so convergence/deadlock behavior is deterministic in tests.
            if text.contains("agree") {
                Ok(vec![1.0, 0.0])
            } else {
                Ok(vec![0.0, 1.0])
            }
        }
    }

    struct StaticAdapter {
        name: String,
        replies: HashMap<String, String>,
    }

    #[async_trait]
    impl ProviderAdapter for StaticAdapter {
        fn provider_name(&self) -> &str {
            &self.name
        }

        async fn send(
            &self,
            member: &CouncilMember,
            _prompt: &ProviderPrompt,
        ) -> Result<ProviderResponse, crate::error::ProviderError> {
            let content = self.replies.get(&member.id).cloned().unwrap_or_else(|| "agree".to_string());
            Ok(ProviderResponse {
                content,
                token_usage: crate::types::TokenUsage { prompt: 1, completion: 1 },
                latency: Duration::from_millis(1),
            })
        }

        async fn health(&self) -> Result<Duration, crate::error::ProviderError> {
            Ok(Duration::from_millis(1))
        }
    }

    fn member(id: &str) -> CouncilMember {
        CouncilMember {
            id: id.into(),
            provider: "test".into(),
            model: "m".into(),
            version: None,
            weight: None,
            timeout_seconds: 5,
            retry_policy: crate::types::RetryPolicy::default(),
        }
    }

    fn initial(id: &str, content: &str) -> InitialResponse {
        InitialResponse {
            member_id: id.into(),
            content: content.into(),
            token_usage: crate::types::TokenUsage { prompt: 1, completion: 1 },
            latency: Duration::from_millis(1),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn converges_when_all_members_agree() {
        let mut pool = ProviderPool::new();
        let mut replies = HashMap::new();
        replies.insert("a".to_string(), "agree".to_string());
        replies.insert("b".to_string(), "agree".to_string());
        pool.register(Arc::new(StaticAdapter { name: "test".into(), replies }));

        let members = vec![member("a"), member("b")];
        let initial_responses = vec![initial("a", "disagree"), initial("b", "disagree")];
        let config = IterativeConsensusConfig::default();

        let decision = negotiate(&DeterministicEmbeddings, &pool, &members, "q", &initial_responses, &config).await;
        assert_eq!(decision.confidence, Confidence::High);
        assert!(matches!(
            decision.synthesis_strategy,
            SynthesisStrategy::IterativeConsensus { fallback_reason: None }
        ));
    }

    #[tokio::test]
    async fn falls_back_on_persistent_disagreement() {
        let mut pool = ProviderPool::new();
        let mut replies = HashMap::new();
        replies.insert("a".to_string(), "disagree".to_string());
        replies.insert("b".to_string(), "agree".to_string());
        pool.register(Arc::new(StaticAdapter { name: "test".into(), replies }));

        let members = vec![member("a"), member("b")];
        let initial_responses = vec![initial("a", "disagree"), initial("b", "agree")];
        let mut config = IterativeConsensusConfig::default();
        config.max_rounds = 4;
        config.deadlock_window = 2;

        let decision = negotiate(&DeterministicEmbeddings, &pool, &members, "q", &initial_responses, &config).await;
        assert!(matches!(
            decision.synthesis_strategy,
            SynthesisStrategy::IterativeConsensus { fallback_reason: Some(_) }
        ));
    }

    #[test]
    fn disagreement_summary_reports_distinguishing_terms() {
        let responses = vec![
            NegotiationResponse { member_id: "a".into(), content: "alpha topic discussion".into(), round_number: 1, token_count: 3 },
            NegotiationResponse { member_id: "b".into(), content: "beta matter argument".into(), round_number: 1, token_count: 3 },
        ];
        let matrix = SimilarityMatrix::build(&[vec![1.0, 0.0], vec![0.0, 1.0]]);
        let summaries = identify_disagreements(&responses, &matrix);
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].contains("a emphasizes"));
    }

    #[test]
    fn agreement_groups_are_disjoint_and_transitive() {
        let responses = vec![
            NegotiationResponse { member_id: "a".into(), content: "x".into(), round_number: 1, token_count: 1 },
            NegotiationResponse { member_id: "b".into(), content: "x".into(), round_number: 1, token_count: 1 },
            NegotiationResponse { member_id: "c".into(), content: "x".into(), round_number: 1, token_count: 1 },
        ];
        // a-b agree, b-c agree, a-c don't directly but transitively grouped via b
        let matrix = SimilarityMatrix {
            values: vec![
                vec![1.0, 0.9, 0.5],
                vec![0.9, 1.0, 0.9],
                vec![0.5, 0.9, 1.0],
            ],
        };
        let groups = extract_agreement_groups(&responses, &matrix, 0.85);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members.len(), 3);
    }

    #[test]
    fn deadlock_detection_requires_full_window_below_threshold() {
        let history = vec![0.5, 0.505, 0.503];
        assert!(is_deadlocked(&history, 3, 0.01, 0.85));
        let not_enough = vec![0.5, 0.505];
        assert!(!is_deadlocked(&not_enough, 3, 0.01, 0.85));
    }
}
