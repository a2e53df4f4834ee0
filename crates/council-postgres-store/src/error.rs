//! Error types for the Postgres-backed budget store.

use thiserror::Error;

/// Errors from the Postgres budget store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("{0}")]
    Generic(String),
}

/// Result alias for the Postgres budget store.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for council_core::error::BudgetError {
    fn from(err: Error) -> Self {
        council_core::error::BudgetError::Backend(err.to_string())
    }
}
