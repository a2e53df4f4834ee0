//! Consensus extraction: a single-shot synthesis strategy that clusters the
//! initial fan-out responses by embedding similarity and reports the most
//! cohesive cluster's best-centered response, with no negotiation rounds.

use chrono::Utc;

use crate::embeddings::EmbeddingService;
use crate::types::{Confidence, ConsensusDecision, InitialResponse, NegotiationResponse, SynthesisStrategy};

use super::iterative::extract_agreement_groups;
use super::similarity::SimilarityMatrix;

/// Cluster `responses` by similarity and extract the decision from the most
/// cohesive group (ties broken by group size, then lexicographically by
/// its first member id). Falls back to the single response with the
/// highest mean similarity to the rest when no group of size > 1 forms.
pub async fn extract_consensus<E: EmbeddingService>(
    embeddings: &E,
    responses: &[InitialResponse],
    agreement_threshold: f64,
) -> Result<ConsensusDecision, crate::embeddings::EmbeddingError> {
    let negotiation_responses: Vec<NegotiationResponse> = responses
        .iter()
        .map(|r| NegotiationResponse {
            member_id: r.member_id.clone(),
            content: r.content.clone(),
            round_number: 0,
            token_count: r.token_usage.total(),
        })
        .collect();

    let mut vectors = Vec::with_capacity(responses.len());
    for r in responses {
        vectors.push(embeddings.embed(&r.content).await?);
    }
    let matrix = SimilarityMatrix::build(&vectors);
    let avg = matrix.average();

    let groups = extract_agreement_groups(&negotiation_responses, &matrix, agreement_threshold);
    let best_group = groups
        .iter()
        .max_by(|a, b| a.cohesion.partial_cmp(&b.cohesion).unwrap_or(std::cmp::Ordering::Equal));

    let (content, agreement_level, contributing_members) = match best_group {
        Some(group) => {
            let indices: Vec<usize> =
                group.members.iter().map(|id| negotiation_responses.iter().position(|r| &r.member_id == id).unwrap()).collect();
            let best_idx = *indices
                .iter()
                .max_by(|&&a, &&b| {
                    let score = |idx: usize| -> f64 {
                        indices.iter().filter(|&&o| o != idx).map(|&o| matrix.get(idx, o)).sum::<f64>()
                            / (indices.len().max(2) - 1) as f64
                    };
                    score(a)
                        .partial_cmp(&score(b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(negotiation_responses[b].member_id.cmp(&negotiation_responses[a].member_id))
                })
                .expect("group is non-empty");
            (negotiation_responses[best_idx].content.clone(), group.cohesion, group.members.clone())
        }
        None => {
            // No cohesive group formed; report the single response closest to the centroid.
            let n = negotiation_responses.len();
            let best_idx = (0..n)
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
                        .then(negotiation_responses[b].member_id.cmp(&negotiation_responses[a].member_id))
                })
                .unwrap_or(0);
            (
                negotiation_responses.get(best_idx).map(|r| r.content.clone()).unwrap_or_default(),
                avg,
                negotiation_responses.iter().map(|r| r.member_id.clone()).collect(),
            )
        }
    };

    Ok(ConsensusDecision {
        content,
        confidence: Confidence::from_agreement_level(agreement_level),
        agreement_level,
        synthesis_strategy: SynthesisStrategy::ConsensusExtraction,
        contributing_members,
        timestamp: Utc::now(),
    })
}
