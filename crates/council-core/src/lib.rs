//! Request-level orchestration engine for the AI council proxy.
//!
//! [`orchestrator::Orchestrator`] is the single entry point: it wires the
//! idempotency cache, budget enforcer, provider pool, a synthesis strategy,
//! and an audit store behind one `execute` call implementing the
//! `New -> Admitting -> Fanning-Out -> (Deliberating)? -> Synthesizing ->
//! Publishing -> Done|Failed|TimedOut` state machine. Every other module in
//! this crate is a pluggable seam the orchestrator depends on through a
//! trait, so that a caller can swap in durable (Redis, Postgres) or
//! provider-specific (OpenAI, Anthropic) implementations from their own
//! crates without this crate knowing about them.

pub mod audit;
pub mod budget;
pub mod config;
pub mod cost;
pub mod embeddings;
pub mod error;
pub mod idempotency;
pub mod orchestrator;
pub mod provider;
pub mod synthesis;
pub mod tools;
pub mod types;

pub use error::{
    BudgetError, Error, IdempotencyError, OrchestratorError, ProviderError, Result, ToolError,
};
pub use orchestrator::{FlatPricingCatalog, Orchestrator, PricingCatalog};
