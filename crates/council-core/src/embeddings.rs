//! Embedding service seam consumed by the iterative consensus synthesizer.
//!
//! No concrete implementation lives in this crate — callers wire in
//! whichever embedding provider they use. `council-testing` ships a
//! deterministic double for tests.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    RequestFailed(String),
}

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}
