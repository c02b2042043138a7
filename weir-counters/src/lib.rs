//! Weir Behavioral Counters
//!
//! Write path for per-tenant, per-person, per-predicate, per-day match
//! counters. Every registered predicate ("action") of an event's tenant is
//! evaluated against the event's filter context; matches are accumulated
//! across the batch and written in one batched, atomic-increment call
//! against the counter store.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use weir_event::TeamId;

pub mod processor;

pub use processor::{
    Action, ActionRegistry, BehavioralEvent, BehavioralEventProcessor, FilterContext, Predicate,
    PredicateError,
};

/// Composite key of one behavioral counter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterKey {
    pub team_id: TeamId,

    /// Fixed-length digest of the predicate's canonical serialized form
    pub filter_hash: String,

    pub person_id: String,

    /// Calendar day in `YYYY-MM-DD`
    pub date: String,
}

/// One pending increment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterUpdate {
    pub key: CounterKey,
}

/// First 16 hex characters of the SHA-256 of the predicate's canonical
/// JSON serialization. Stable across processes for the same predicate.
pub fn filter_hash(bytecode: &serde_json::Value) -> String {
    let canonical = serde_json::to_string(bytecode).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

/// Columnar counter store shared across worker instances.
///
/// Writes must use server-side atomic increments, never read-modify-write:
/// concurrent workers incrementing the same key must not lose updates.
#[async_trait]
pub trait BehavioralCounterStore: Send + Sync {
    /// Apply a batch of increments in one write
    async fn increment_batch(&self, updates: &[CounterUpdate]) -> Result<(), CounterStoreError>;

    /// Read a counter; `None` when the key was never written
    async fn get_counter(&self, key: &CounterKey) -> Result<Option<u64>, CounterStoreError>;
}

/// Counter store errors (dependency failures, retriable)
#[derive(Debug, Error)]
pub enum CounterStoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

/// In-process counter store used in tests and single-node deployments
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    counters: DashMap<CounterKey, u64>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BehavioralCounterStore for InMemoryCounterStore {
    async fn increment_batch(&self, updates: &[CounterUpdate]) -> Result<(), CounterStoreError> {
        for update in updates {
            *self.counters.entry(update.key.clone()).or_insert(0) += 1;
        }
        Ok(())
    }

    async fn get_counter(&self, key: &CounterKey) -> Result<Option<u64>, CounterStoreError> {
        Ok(self.counters.get(key).map(|c| *c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_hash_is_stable_and_truncated() {
        let bytecode = serde_json::json!(["_H", 1, 32, "$pageview", 32, "event", 1, 1, 11]);
        let hash = filter_hash(&bytecode);

        assert_eq!(hash.len(), 16);
        assert_eq!(hash, filter_hash(&bytecode));
        assert_ne!(hash, filter_hash(&serde_json::json!(["_H", 2])));
    }

    fn key(person: &str) -> CounterKey {
        CounterKey {
            team_id: 2,
            filter_hash: "abcd1234abcd1234".to_string(),
            person_id: person.to_string(),
            date: "2024-07-03".to_string(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_store_increments() {
        let store = InMemoryCounterStore::new();
        let updates = vec![
            CounterUpdate { key: key("p1") },
            CounterUpdate { key: key("p1") },
            CounterUpdate { key: key("p2") },
        ];

        store.increment_batch(&updates).await.unwrap();
        store.increment_batch(&[CounterUpdate { key: key("p1") }]).await.unwrap();

        assert_eq!(store.get_counter(&key("p1")).await.unwrap(), Some(3));
        assert_eq!(store.get_counter(&key("p2")).await.unwrap(), Some(1));
        assert_eq!(store.get_counter(&key("p3")).await.unwrap(), None);
    }
}
