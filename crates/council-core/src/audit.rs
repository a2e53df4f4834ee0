//! Durable audit trail: the rows the orchestrator's Publishing step writes
//! once a decision is finalized.
//!
//! Mirrors `Checkpointer`'s shape (one trait, an in-memory default, a
//! backend-specific crate per store) rather than folding persistence into
//! the orchestrator itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::cost::CostEntry;
use crate::types::{ConsensusDecision, DeliberationThread, UserRequest};

#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum AuditError {
    #[error("audit backend error: {0}")]
    Backend(String),
}

/// One durable record of a completed request: the request itself, its
/// deliberation history (if any), the final decision, and its per-member costs.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub request: UserRequest,
    pub deliberation: DeliberationThread,
    pub decision: ConsensusDecision,
    pub costs: Vec<CostEntry>,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError>;
}

/// In-memory [`AuditStore`], useful for tests and for running without a
/// configured durable backend.
#[derive(Default)]
pub struct InMemoryAuditStore {
    records: std::sync::Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).push(record);
        Ok(())
    }
}
