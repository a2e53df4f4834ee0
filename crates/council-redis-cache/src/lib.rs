//! Redis-backed [`CoordinationCache`] for multi-process idempotency
//! coordination.
//!
//! Follows the connection-management and key-prefix conventions of the
//! crate this is grounded on: an async `ConnectionManager`, a
//! `{prefix}:...` key convention, and an error enum bridged into the
//! core crate's error type. Unlike that crate's unconditional-overwrite
//! `save`, [`mark_in_progress`] needs true set-if-absent semantics, so it
//! uses `SET key value NX EX ttl` instead of a pipelined write.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;

use council_core::error::IdempotencyError;
use council_core::idempotency::CoordinationCache;
use council_core::types::{CacheLookup, ConsensusDecision, ErrorResponse, IdempotencyRecord, IdempotencyStatus};

/// Errors from the Redis transport underlying [`RedisCoordinationCache`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RedisCacheError {
    #[error("redis connection error: {0}")]
    ConnectionError(String),

    #[error("redis command error: {0}")]
    CommandError(String),

    #[error("failed to serialize idempotency record: {0}")]
    SerializationError(String),

    #[error("failed to deserialize idempotency record: {0}")]
    DeserializationError(String),
}

impl From<redis::RedisError> for RedisCacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() {
            Self::ConnectionError(err.to_string())
        } else {
            Self::CommandError(err.to_string())
        }
    }
}

impl From<RedisCacheError> for IdempotencyError {
    fn from(err: RedisCacheError) -> Self {
        IdempotencyError::Backend(err.to_string())
    }
}

/// A [`CoordinationCache`] backed by a single Redis (or Redis-compatible)
/// instance, shared across proxy replicas.
#[derive(Clone)]
pub struct RedisCoordinationCache {
    connection_manager: ConnectionManager,
    key_prefix: String,
}

impl std::fmt::Debug for RedisCoordinationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCoordinationCache")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisCoordinationCache {
    /// Connect to `redis_url` using the default `council` key prefix.
    pub async fn new(redis_url: &str) -> Result<Self, RedisCacheError> {
        Self::with_key_prefix(redis_url, "council").await
    }

    /// Connect to `redis_url`, namespacing all keys under `key_prefix`.
    pub async fn with_key_prefix(redis_url: &str, key_prefix: impl Into<String>) -> Result<Self, RedisCacheError> {
        let client = redis::Client::open(redis_url).map_err(RedisCacheError::from)?;
        let connection_manager = ConnectionManager::new(client).await.map_err(RedisCacheError::from)?;
        Ok(Self { connection_manager, key_prefix: key_prefix.into() })
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}:idempotency:{key}", self.key_prefix)
    }

    fn serialize(record: &IdempotencyRecord) -> Result<String, RedisCacheError> {
        serde_json::to_string(record).map_err(|e| RedisCacheError::SerializationError(e.to_string()))
    }

    fn deserialize(raw: &str) -> Result<IdempotencyRecord, RedisCacheError> {
        serde_json::from_str(raw).map_err(|e| RedisCacheError::DeserializationError(e.to_string()))
    }

    async fn write_unconditionally(&self, key: &str, record: &IdempotencyRecord, ttl_seconds: u64) -> Result<(), IdempotencyError> {
        let value = Self::serialize(record).map_err(IdempotencyError::from)?;
        let mut conn = self.connection_manager.clone();
        conn.set_ex::<_, _, ()>(self.record_key(key), value, ttl_seconds)
            .await
            .map_err(|e| IdempotencyError::from(RedisCacheError::from(e)))
    }
}

#[async_trait]
impl CoordinationCache for RedisCoordinationCache {
    async fn check_key(&self, key: &str) -> CacheLookup {
        let mut conn = self.connection_manager.clone();
        let raw: Option<String> = match conn.get(self.record_key(key)).await {
            Ok(raw) => raw,
            Err(_) => return CacheLookup::NotFound,
        };
        let Some(raw) = raw else {
            return CacheLookup::NotFound;
        };
        match Self::deserialize(&raw) {
            Ok(record) => to_lookup(record),
            Err(_) => CacheLookup::NotFound,
        }
    }

    async fn mark_in_progress(&self, key: &str, request_id: &str, ttl_seconds: u64) -> Result<(), IdempotencyError> {
        let record = IdempotencyRecord {
            request_id: request_id.to_string(),
            status: IdempotencyStatus::InProgress,
            decision: None,
            error_response: None,
            timestamp: chrono::Utc::now(),
        };
        let value = Self::serialize(&record).map_err(IdempotencyError::from)?;

        let mut conn = self.connection_manager.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(self.record_key(key))
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await
            .map_err(|e| IdempotencyError::from(RedisCacheError::from(e)))?;

        if set.is_none() {
            return Err(IdempotencyError::KeyAlreadyExists { key: key.to_string() });
        }
        Ok(())
    }

    async fn cache_result(
        &self,
        key: &str,
        request_id: &str,
        decision: ConsensusDecision,
        ttl_seconds: u64,
    ) -> Result<(), IdempotencyError> {
        let record = IdempotencyRecord {
            request_id: request_id.to_string(),
            status: IdempotencyStatus::Completed,
            decision: Some(decision),
            error_response: None,
            timestamp: chrono::Utc::now(),
        };
        self.write_unconditionally(key, &record, ttl_seconds).await
    }

    async fn cache_error(
        &self,
        key: &str,
        request_id: &str,
        error_response: ErrorResponse,
        ttl_seconds: u64,
    ) -> Result<(), IdempotencyError> {
        let record = IdempotencyRecord {
            request_id: request_id.to_string(),
            status: IdempotencyStatus::Failed,
            decision: None,
            error_response: Some(error_response),
            timestamp: chrono::Utc::now(),
        };
        self.write_unconditionally(key, &record, ttl_seconds).await
    }
}

fn to_lookup(record: IdempotencyRecord) -> CacheLookup {
    match record.status {
        IdempotencyStatus::InProgress => CacheLookup::InProgress { request_id: record.request_id },
        IdempotencyStatus::Completed => CacheLookup::Completed {
            request_id: record.request_id,
            decision: record.decision.unwrap_or(ConsensusDecision {
                content: String::new(),
                confidence: council_core::types::Confidence::Low,
                agreement_level: 0.0,
                synthesis_strategy: council_core::types::SynthesisStrategy::WeightedFusion,
                contributing_members: Vec::new(),
                timestamp: record.timestamp,
            }),
        },
        IdempotencyStatus::Failed => CacheLookup::Failed {
            request_id: record.request_id,
            error_response: record.error_response.unwrap_or(ErrorResponse {
                kind: "unknown".to_string(),
                message: "record missing error payload".to_string(),
            }),
        },
    }
}

/// Helper for tests and operators: formats the Redis key for `key` without
/// requiring a live connection.
#[must_use]
pub fn key_for(key_prefix: &str, key: &str) -> String {
    format!("{key_prefix}:idempotency:{key}")
}
