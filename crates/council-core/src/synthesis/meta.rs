//! Meta-synthesis: a dedicated judge model reads every response and writes
//! the final answer itself, rather than the council's responses being
//! combined mechanically.
//!
//! The judge call is out of scope here, the same way [`crate::embeddings`]
//! leaves the embedding call to the caller: this module only defines the
//! seam and wraps its output into a [`ConsensusDecision`].

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::types::{Confidence, ConsensusDecision, InitialResponse, SynthesisStrategy};

#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum MetaSynthesisError {
    #[error("meta-synthesis judge call failed: {0}")]
    JudgeFailed(String),
}

#[async_trait]
pub trait MetaSynthesizer: Send + Sync {
    async fn synthesize(&self, query: &str, responses: &[InitialResponse]) -> Result<String, MetaSynthesisError>;
}

/// Invoke `judge` over the council's initial responses and wrap its verdict
/// into a decision. Confidence is fixed at `Medium`: a judge model's own
/// certainty isn't observable from its text output alone.
pub async fn synthesize<J: MetaSynthesizer + ?Sized>(
    judge: &J,
    query: &str,
    responses: &[InitialResponse],
) -> Result<ConsensusDecision, MetaSynthesisError> {
    let content = judge.synthesize(query, responses).await?;
    Ok(ConsensusDecision {
        content,
        confidence: Confidence::Medium,
        agreement_level: 0.0,
        synthesis_strategy: SynthesisStrategy::MetaSynthesis,
        contributing_members: responses.iter().map(|r| r.member_id.clone()).collect(),
        timestamp: Utc::now(),
    })
}
