//! Weighted fusion: combine a round's responses into one decision using
//! each member's configured weight, renormalized across survivors.

use chrono::Utc;

use crate::types::{Confidence, ConsensusDecision, CouncilMember, NegotiationResponse, SynthesisStrategy};

/// Default weight assigned to a member with no explicit `weight` configured.
fn default_weight(n: usize) -> f64 {
    1.0 / n as f64
}

/// Renormalized `(member_id, weight)` pairs for the given responses, using
/// each member's configured weight or `1/n` if unset.
#[must_use]
fn renormalized_weights(responses: &[NegotiationResponse], members: &[CouncilMember]) -> Vec<(String, f64)> {
    let n = responses.len();
    let raw: Vec<(String, f64)> = responses
        .iter()
        .map(|r| {
            let weight = members
                .iter()
                .find(|m| m.id == r.member_id)
                .and_then(|m| m.weight)
                .unwrap_or_else(|| default_weight(n));
            (r.member_id.clone(), weight)
        })
        .collect();
    let total: f64 = raw.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        return responses.iter().map(|r| (r.member_id.clone(), default_weight(n))).collect();
    }
    raw.into_iter().map(|(id, w)| (id, w / total)).collect()
}

/// Fuse `responses` by selecting the content of the highest-weighted
/// member, tie-breaking lexicographically on member id for determinism.
/// `strategy` is tagged onto the resulting decision verbatim, so the same
/// fusion logic serves both the standalone `weighted_fusion` strategy and
/// the iterative-consensus fallback path.
///
/// Returns `None` if `responses` is empty.
#[must_use]
pub fn weighted_fusion_decision(
    responses: &[NegotiationResponse],
    members: &[CouncilMember],
    agreement_level: f64,
    strategy: SynthesisStrategy,
) -> Option<ConsensusDecision> {
    if responses.is_empty() {
        return None;
    }
    let weights = renormalized_weights(responses, members);
    let (winner_id, _) = weights
        .iter()
        .max_by(|(id_a, w_a), (id_b, w_b)| {
            w_a.partial_cmp(w_b).unwrap_or(std::cmp::Ordering::Equal).then(id_b.cmp(id_a))
        })
        .expect("responses is non-empty");

    let winning_response = responses.iter().find(|r| &r.member_id == winner_id)?;

    Some(ConsensusDecision {
        content: winning_response.content.clone(),
        confidence: Confidence::from_agreement_level(agreement_level),
        agreement_level,
        synthesis_strategy: strategy,
        contributing_members: responses.iter().map(|r| r.member_id.clone()).collect(),
        timestamp: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FallbackReason;

    fn member(id: &str, weight: Option<f64>) -> CouncilMember {
        CouncilMember {
            id: id.into(),
            provider: "p".into(),
            model: "m".into(),
            version: None,
            weight,
            timeout_seconds: 5,
            retry_policy: crate::types::RetryPolicy::default(),
        }
    }

    fn response(id: &str, content: &str) -> NegotiationResponse {
        NegotiationResponse { member_id: id.into(), content: content.into(), round_number: 1, token_count: 5 }
    }

    #[test]
    fn picks_highest_weighted_member_content() {
        let members = vec![member("a", Some(0.2)), member("b", Some(0.8))];
        let responses = vec![response("a", "from a"), response("b", "from b")];
        let decision =
            weighted_fusion_decision(&responses, &members, 0.5, SynthesisStrategy::WeightedFusion).unwrap();
        assert_eq!(decision.content, "from b");
    }

    #[test]
    fn defaults_to_equal_weights_when_unconfigured() {
        let members = vec![member("a", None), member("b", None)];
        let responses = vec![response("b", "from b"), response("a", "from a")];
        // equal weights -> tie broken lexicographically, "a" wins
        let decision =
            weighted_fusion_decision(&responses, &members, 0.5, SynthesisStrategy::WeightedFusion).unwrap();
        assert_eq!(decision.content, "from a");
    }

    #[test]
    fn empty_responses_yields_none() {
        assert!(weighted_fusion_decision(&[], &[], 0.0, SynthesisStrategy::WeightedFusion).is_none());
    }

    #[test]
    fn records_fallback_reason() {
        let members = vec![member("a", None)];
        let responses = vec![response("a", "x")];
        let decision = weighted_fusion_decision(
            &responses,
            &members,
            0.3,
            SynthesisStrategy::IterativeConsensus { fallback_reason: Some(FallbackReason::Deadlock) },
        )
        .unwrap();
        assert!(matches!(
            decision.synthesis_strategy,
            SynthesisStrategy::IterativeConsensus { fallback_reason: Some(FallbackReason::Deadlock) }
        ));
    }

    #[test]
    fn confidence_derives_from_agreement_level_not_hardcoded() {
        let members = vec![member("a", None)];
        let responses = vec![response("a", "x")];
        let decision =
            weighted_fusion_decision(&responses, &members, 1.0, SynthesisStrategy::WeightedFusion).unwrap();
        assert_eq!(decision.confidence, Confidence::High);
    }
}
