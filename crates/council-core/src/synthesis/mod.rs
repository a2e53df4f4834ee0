//! Synthesis strategies: turn a council's responses into one
//! [`crate::types::ConsensusDecision`].

pub mod consensus;
pub mod fusion;
pub mod iterative;
pub mod meta;
pub mod prompt_template;
pub mod sanitize;
pub mod similarity;

pub use meta::{MetaSynthesisError, MetaSynthesizer};
