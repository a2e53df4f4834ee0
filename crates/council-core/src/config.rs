//! Configuration snapshots consumed by the orchestrator, and the versioned
//! `ConfigStore` they are loaded through.
//!
//! Persisted shape mirrors `configurations(config_type, version, config_data,
//! active, updated_at)`: effective config is the row with the highest
//! `version` among `active = true` rows for a given `config_type`.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::CouncilMember;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilConfig {
    pub members: Vec<CouncilMember>,
    pub minimum_size: usize,
    pub require_minimum_for_consensus: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliberationConfig {
    pub rounds: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisStrategyKind {
    ConsensusExtraction,
    WeightedFusion,
    MetaSynthesis,
    IterativeConsensus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    pub strategy: SynthesisStrategyKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Global request deadline, in seconds, measured from the start of admission.
    pub global_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransparencyConfig {
    /// Whether per-member raw exchanges are exposed alongside the decision.
    pub expose_exchanges: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationMode {
    Parallel,
    Sequential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterativeConsensusConfig {
    pub max_rounds: u32,
    pub agreement_threshold: f64,
    pub deadlock_window: usize,
    pub deadlock_tolerance: f64,
    pub negotiation_mode: NegotiationMode,
    pub embedding_model: String,
}

impl Default for IterativeConsensusConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            agreement_threshold: 0.85,
            deadlock_window: 3,
            deadlock_tolerance: 0.01,
            negotiation_mode: NegotiationMode::Parallel,
            embedding_model: "default".to_string(),
        }
    }
}

/// A full snapshot of the five config surfaces, as the orchestrator consumes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    pub council: CouncilConfig,
    pub deliberation: DeliberationConfig,
    pub synthesis: SynthesisConfig,
    pub performance: PerformanceConfig,
    pub transparency: TransparencyConfig,
    pub iterative_consensus: IterativeConsensusConfig,
}

/// One versioned, possibly-inactive config row of a given `config_type`.
#[derive(Debug, Clone)]
struct ConfigRow<T> {
    version: u64,
    data: T,
    active: bool,
    updated_at: DateTime<Utc>,
}

/// Versioned configuration storage, keyed by config type.
///
/// Resolves the open question in `spec.md` §9 about `updateConfig` races the
/// same way the source does: writing computes `MAX(version) + 1` and
/// deactivates the prior active row, a plain read-then-write rather than a
/// `SELECT ... FOR UPDATE` — acceptable because the spec explicitly permits
/// leaving this racy under high contention.
#[derive(Default)]
pub struct InMemoryConfigStore {
    council: Mutex<HashMap<String, Vec<ConfigRow<CouncilConfig>>>>,
    deliberation: Mutex<HashMap<String, Vec<ConfigRow<DeliberationConfig>>>>,
    synthesis: Mutex<HashMap<String, Vec<ConfigRow<SynthesisConfig>>>>,
    performance: Mutex<HashMap<String, Vec<ConfigRow<PerformanceConfig>>>>,
    transparency: Mutex<HashMap<String, Vec<ConfigRow<TransparencyConfig>>>>,
    iterative_consensus: Mutex<HashMap<String, Vec<ConfigRow<IterativeConsensusConfig>>>>,
}

macro_rules! config_accessors {
    ($field:ident, $ty:ty, $get:ident, $put:ident) => {
        /// Fetch the highest-versioned active row for `config_type`, if any.
        pub fn $get(&self, config_type: &str) -> Option<$ty> {
            let map = self.$field.lock().unwrap_or_else(|e| e.into_inner());
            map.get(config_type)
                .and_then(|rows| rows.iter().filter(|r| r.active).max_by_key(|r| r.version))
                .map(|r| r.data.clone())
        }

        /// Insert a new version of `config_type`, deactivating any prior active row.
        pub fn $put(&self, config_type: &str, data: $ty) {
            let mut map = self.$field.lock().unwrap_or_else(|e| e.into_inner());
            let rows = map.entry(config_type.to_string()).or_default();
            let next_version = rows.iter().map(|r| r.version).max().unwrap_or(0) + 1;
            for row in rows.iter_mut() {
                row.active = false;
            }
            rows.push(ConfigRow {
                version: next_version,
                data,
                active: true,
                updated_at: Utc::now(),
            });
        }
    };
}

impl InMemoryConfigStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    config_accessors!(council, CouncilConfig, get_council, put_council);
    config_accessors!(deliberation, DeliberationConfig, get_deliberation, put_deliberation);
    config_accessors!(synthesis, SynthesisConfig, get_synthesis, put_synthesis);
    config_accessors!(performance, PerformanceConfig, get_performance, put_performance);
    config_accessors!(transparency, TransparencyConfig, get_transparency, put_transparency);
    config_accessors!(
        iterative_consensus,
        IterativeConsensusConfig,
        get_iterative_consensus,
        put_iterative_consensus
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_returns_equivalent_config() {
        let store = InMemoryConfigStore::new();
        let cfg = PerformanceConfig { global_timeout: 30 };
        store.put_performance("default", cfg.clone());
        let loaded = store.get_performance("default").unwrap();
        assert_eq!(loaded.global_timeout, cfg.global_timeout);
    }

    #[test]
    fn second_write_supersedes_first_and_bumps_version() {
        let store = InMemoryConfigStore::new();
        store.put_performance("default", PerformanceConfig { global_timeout: 30 });
        store.put_performance("default", PerformanceConfig { global_timeout: 60 });
        let loaded = store.get_performance("default").unwrap();
        assert_eq!(loaded.global_timeout, 60);

        let rows = store.performance.lock().unwrap();
        let rows = rows.get("default").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().filter(|r| r.active).count(), 1);
        assert_eq!(rows.iter().max_by_key(|r| r.version).unwrap().version, 2);
    }

    #[test]
    fn missing_config_type_returns_none() {
        let store = InMemoryConfigStore::new();
        assert!(store.get_synthesis("nonexistent").is_none());
    }
}
