//! At-most-once-effect coordination for concurrent requests sharing an
//! idempotency key.
//!
//! The in-memory implementation is `DashMap`-backed, matching the teacher's
//! use of `dashmap` for concurrent in-memory state: `mark_in_progress`'s
//! set-if-absent check holds the shard's entry lock for the full
//! check-then-insert, giving it the same atomicity a `Mutex` critical
//! section would.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;

use crate::error::IdempotencyError;
use crate::types::{CacheLookup, ConsensusDecision, ErrorResponse, IdempotencyRecord, IdempotencyStatus};

/// Default TTL for idempotency records, in seconds (24h).
pub const DEFAULT_TTL_SECONDS: u64 = 86_400;

/// Interval between polls in [`CoordinationCache::wait_for_completion`].
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Coordination surface for idempotency keys.
///
/// `mark_in_progress` is the only operation required to be atomic across
/// processes; all other operations tolerate last-writer-wins on terminal
/// states (§4.4).
#[async_trait]
pub trait CoordinationCache: Send + Sync {
    async fn check_key(&self, key: &str) -> CacheLookup;

    /// Atomically set-if-absent. Fails with `KeyAlreadyExists` if a record
    /// already exists for `key`, regardless of its status.
    async fn mark_in_progress(
        &self,
        key: &str,
        request_id: &str,
        ttl_seconds: u64,
    ) -> Result<(), IdempotencyError>;

    async fn cache_result(
        &self,
        key: &str,
        request_id: &str,
        decision: ConsensusDecision,
        ttl_seconds: u64,
    ) -> Result<(), IdempotencyError>;

    async fn cache_error(
        &self,
        key: &str,
        request_id: &str,
        error_response: ErrorResponse,
        ttl_seconds: u64,
    ) -> Result<(), IdempotencyError>;

    /// Poll every 100ms until the record reaches a terminal status, the key
    /// vanishes (`RequestNoLongerInCache`), or `timeout_ms` elapses (`WaitTimeout`).
    async fn wait_for_completion(&self, key: &str, timeout_ms: u64) -> Result<CacheLookup, IdempotencyError> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            match self.check_key(key).await {
                CacheLookup::NotFound => {
                    return Err(IdempotencyError::RequestNoLongerInCache { key: key.to_string() })
                }
                lookup @ (CacheLookup::Completed { .. } | CacheLookup::Failed { .. }) => return Ok(lookup),
                CacheLookup::InProgress { .. } => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(IdempotencyError::WaitTimeout {
                            key: key.to_string(),
                            timeout_ms,
                        });
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }
}

struct CacheEntry {
    record: IdempotencyRecord,
    expires_at: std::time::Instant,
}

/// In-memory [`CoordinationCache`], the default and the one test suites use.
#[derive(Clone)]
pub struct InMemoryCoordinationCache {
    entries: Arc<DashMap<String, CacheEntry>>,
}

impl InMemoryCoordinationCache {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: Arc::new(DashMap::new()) }
    }

    fn get_live(&self, key: &str) -> Option<IdempotencyRecord> {
        let live = self.entries.get(key).and_then(|entry| {
            (entry.expires_at > std::time::Instant::now()).then(|| entry.record.clone())
        });
        if live.is_none() {
            self.entries.remove(key);
        }
        live
    }
}

impl Default for InMemoryCoordinationCache {
    fn default() -> Self {
        Self::new()
    }
}

fn to_lookup(record: IdempotencyRecord) -> CacheLookup {
    match record.status {
        IdempotencyStatus::InProgress => CacheLookup::InProgress { request_id: record.request_id },
        IdempotencyStatus::Completed => CacheLookup::Completed {
            request_id: record.request_id,
            decision: record.decision.expect("completed record always carries a decision"),
        },
        IdempotencyStatus::Failed => CacheLookup::Failed {
            request_id: record.request_id,
            error_response: record.error_response.expect("failed record always carries an error"),
        },
    }
}

#[async_trait]
impl CoordinationCache for InMemoryCoordinationCache {
    async fn check_key(&self, key: &str) -> CacheLookup {
        match self.get_live(key) {
            Some(record) => to_lookup(record),
            None => CacheLookup::NotFound,
        }
    }

    async fn mark_in_progress(
        &self,
        key: &str,
        request_id: &str,
        ttl_seconds: u64,
    ) -> Result<(), IdempotencyError> {
        let now = std::time::Instant::now();
        let fresh = CacheEntry {
            record: IdempotencyRecord {
                request_id: request_id.to_string(),
                status: IdempotencyStatus::InProgress,
                decision: None,
                error_response: None,
                timestamp: Utc::now(),
            },
            expires_at: now + Duration::from_secs(ttl_seconds),
        };
        // entry() holds the shard lock for the full check-then-insert, the
        // same atomicity a Mutex critical section would give.
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(occupied) if occupied.get().expires_at > now => {
                Err(IdempotencyError::KeyAlreadyExists { key: key.to_string() })
            }
            MapEntry::Occupied(mut occupied) => {
                occupied.insert(fresh);
                Ok(())
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(())
            }
        }
    }

    async fn cache_result(
        &self,
        key: &str,
        request_id: &str,
        decision: ConsensusDecision,
        ttl_seconds: u64,
    ) -> Result<(), IdempotencyError> {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                record: IdempotencyRecord {
                    request_id: request_id.to_string(),
                    status: IdempotencyStatus::Completed,
                    decision: Some(decision),
                    error_response: None,
                    timestamp: Utc::now(),
                },
                expires_at: std::time::Instant::now() + Duration::from_secs(ttl_seconds),
            },
        );
        Ok(())
    }

    async fn cache_error(
        &self,
        key: &str,
        request_id: &str,
        error_response: ErrorResponse,
        ttl_seconds: u64,
    ) -> Result<(), IdempotencyError> {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                record: IdempotencyRecord {
                    request_id: request_id.to_string(),
                    status: IdempotencyStatus::Failed,
                    decision: None,
                    error_response: Some(error_response),
                    timestamp: Utc::now(),
                },
                expires_at: std::time::Instant::now() + Duration::from_secs(ttl_seconds),
            },
        );
        Ok(())
    }
}
