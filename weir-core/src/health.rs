//! Function health records and the shared health store.
//!
//! The authoritative health state of every processing function lives in a
//! store shared by all worker instances. The store owns the record; callers
//! never cache authoritative state beyond a short-lived read. The
//! observe-and-transition operation must be atomic per function id (a
//! server-side script or transaction against the real store), otherwise
//! concurrent workers observing the same function lose updates.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tokens are floored here rather than allowed to grow unboundedly
/// negative, so a disabled function's debt recovers within bounded time.
pub const TOKEN_FLOOR: f64 = -1.0;

/// Circuit-breaker status of a processing function.
///
/// Automatic transitions only ever move in the unfavorable direction;
/// recovery is administrative.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy = 1,
    Degraded = 2,
    Disabled = 3,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Disabled => "disabled",
        }
    }
}

/// A function's persisted health record
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub state: HealthState,
    pub tokens: f64,
}

/// Accounting and transition policy applied by the store's atomic script
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    /// Bucket capacity (token ceiling)
    pub capacity: f64,

    /// Tokens refilled per second of elapsed time
    pub refill_per_sec: f64,

    /// Remaining-token ratio above which the function is healthy
    pub degraded_ratio: f64,

    /// Whether reaching zero tokens disables the function automatically
    pub auto_disable: bool,

    /// TTL of the state-change lock set on every transition
    pub lock_ttl_ms: u64,
}

/// One observation to apply against a function's budget
#[derive(Debug, Clone, Copy)]
pub struct ObserveUpdate {
    /// Aggregated cost for this function across the batch
    pub cost: u64,

    /// Observation time (milliseconds since epoch)
    pub now_ms: u64,
}

/// Outcome of an atomic observe-and-transition call
#[derive(Debug, Clone, Copy)]
pub struct ObserveOutcome {
    /// Record after the update
    pub record: HealthRecord,

    /// `(previous, new)` when a state transition was persisted
    pub transition: Option<(HealthState, HealthState)>,
}

/// Pure derivation of state from the token balance.
///
/// Without auto-disable the state clamps at degraded regardless of debt.
pub fn derive_state(tokens: f64, policy: &HealthPolicy) -> HealthState {
    let ratio = tokens / policy.capacity;
    if ratio > policy.degraded_ratio {
        HealthState::Healthy
    } else if ratio > 0.0 {
        HealthState::Degraded
    } else if policy.auto_disable {
        HealthState::Disabled
    } else {
        HealthState::Degraded
    }
}

/// Shared key-value store holding function health records and state-change
/// locks.
///
/// Implementations must make `observe_and_transition` and `force_state`
/// atomic per function id end-to-end; separate read-then-write round trips
/// would lose updates under concurrent workers.
#[async_trait]
pub trait HealthStore: Send + Sync {
    /// Atomically: refill tokens by elapsed time, subtract the observed
    /// cost, derive the candidate state, and persist a state transition
    /// only when the candidate is strictly worse than the stored state and
    /// no state-change lock is active. Token accounting always persists,
    /// locked or not.
    async fn observe_and_transition(
        &self,
        function_id: &str,
        update: ObserveUpdate,
        policy: &HealthPolicy,
    ) -> Result<ObserveOutcome, StoreError>;

    /// Read a record, applying read-time lazy refill without persisting it.
    /// Missing records read as healthy at full capacity.
    async fn get_record(
        &self,
        function_id: &str,
        now_ms: u64,
        policy: &HealthPolicy,
    ) -> Result<HealthRecord, StoreError>;

    /// Atomically force a state independent of token arithmetic. Sets the
    /// state-change lock regardless of whether one is active. Returns the
    /// previous state when the state actually changed.
    async fn force_state(
        &self,
        function_id: &str,
        state: HealthState,
        tokens: f64,
        now_ms: u64,
        lock_ttl_ms: u64,
    ) -> Result<Option<HealthState>, StoreError>;

    /// Remaining state-change lock TTL in milliseconds, if one is active
    async fn lock_remaining_ms(&self, function_id: &str, now_ms: u64)
        -> Result<Option<u64>, StoreError>;

    /// Drop the state-change lock for a function
    async fn clear_lock(&self, function_id: &str) -> Result<(), StoreError>;
}

/// Shared store errors. All of these are dependency failures and therefore
/// retriable by the outer batch loop.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("shared store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    tokens: f64,
    state: HealthState,
    last_observed_ms: u64,
    lock_expires_ms: Option<u64>,
}

/// In-process implementation of the shared store.
///
/// Entry-level locking via the map's shard guards gives the same
/// per-function atomicity the production store gets from a server-side
/// script. Used as the test double and for single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryHealthStore {
    entries: DashMap<String, Entry>,
}

impl InMemoryHealthStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn refill(tokens: f64, elapsed_ms: u64, policy: &HealthPolicy) -> f64 {
        (tokens + elapsed_ms as f64 / 1000.0 * policy.refill_per_sec).min(policy.capacity)
    }

    fn lock_active(entry: &Entry, now_ms: u64) -> bool {
        matches!(entry.lock_expires_ms, Some(expires) if expires > now_ms)
    }
}

#[async_trait]
impl HealthStore for InMemoryHealthStore {
    async fn observe_and_transition(
        &self,
        function_id: &str,
        update: ObserveUpdate,
        policy: &HealthPolicy,
    ) -> Result<ObserveOutcome, StoreError> {
        let mut entry = self
            .entries
            .entry(function_id.to_string())
            .or_insert(Entry {
                tokens: policy.capacity,
                state: HealthState::Healthy,
                last_observed_ms: update.now_ms,
                lock_expires_ms: None,
            });

        let entry = entry.value_mut();

        let elapsed_ms = update.now_ms.saturating_sub(entry.last_observed_ms);
        let refilled = Self::refill(entry.tokens, elapsed_ms, policy);
        entry.tokens = (refilled - update.cost as f64).max(TOKEN_FLOOR);
        entry.last_observed_ms = update.now_ms;

        let candidate = derive_state(entry.tokens, policy);
        let mut transition = None;

        // Only unfavorable moves happen automatically, and only when the
        // cooldown lock has expired. While locked, debt accumulates
        // silently; the next observation after expiry re-evaluates.
        if candidate > entry.state && !Self::lock_active(entry, update.now_ms) {
            let previous = entry.state;
            entry.state = candidate;
            entry.lock_expires_ms = Some(update.now_ms + policy.lock_ttl_ms);
            transition = Some((previous, candidate));
        }

        Ok(ObserveOutcome {
            record: HealthRecord {
                state: entry.state,
                tokens: entry.tokens,
            },
            transition,
        })
    }

    async fn get_record(
        &self,
        function_id: &str,
        now_ms: u64,
        policy: &HealthPolicy,
    ) -> Result<HealthRecord, StoreError> {
        let record = match self.entries.get(function_id) {
            Some(entry) => {
                let elapsed_ms = now_ms.saturating_sub(entry.last_observed_ms);
                HealthRecord {
                    state: entry.state,
                    tokens: Self::refill(entry.tokens, elapsed_ms, policy),
                }
            }
            None => HealthRecord {
                state: HealthState::Healthy,
                tokens: policy.capacity,
            },
        };
        Ok(record)
    }

    async fn force_state(
        &self,
        function_id: &str,
        state: HealthState,
        tokens: f64,
        now_ms: u64,
        lock_ttl_ms: u64,
    ) -> Result<Option<HealthState>, StoreError> {
        let mut entry = self
            .entries
            .entry(function_id.to_string())
            .or_insert(Entry {
                tokens,
                state: HealthState::Healthy,
                last_observed_ms: now_ms,
                lock_expires_ms: None,
            });

        let entry = entry.value_mut();
        let previous = entry.state;

        entry.tokens = tokens;
        entry.last_observed_ms = now_ms;
        entry.lock_expires_ms = Some(now_ms + lock_ttl_ms);

        if previous == state {
            return Ok(None);
        }

        entry.state = state;
        Ok(Some(previous))
    }

    async fn lock_remaining_ms(
        &self,
        function_id: &str,
        now_ms: u64,
    ) -> Result<Option<u64>, StoreError> {
        Ok(self.entries.get(function_id).and_then(|entry| {
            entry
                .lock_expires_ms
                .filter(|expires| *expires > now_ms)
                .map(|expires| expires - now_ms)
        }))
    }

    async fn clear_lock(&self, function_id: &str) -> Result<(), StoreError> {
        if let Some(mut entry) = self.entries.get_mut(function_id) {
            entry.lock_expires_ms = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> HealthPolicy {
        HealthPolicy {
            capacity: 10_000.0,
            refill_per_sec: 10.0,
            degraded_ratio: 0.8,
            auto_disable: true,
            lock_ttl_ms: 60_000,
        }
    }

    #[test]
    fn test_derive_state_thresholds() {
        let policy = policy();
        assert_eq!(derive_state(8100.0, &policy), HealthState::Healthy);
        assert_eq!(derive_state(8000.0, &policy), HealthState::Degraded);
        assert_eq!(derive_state(1.0, &policy), HealthState::Degraded);
        assert_eq!(derive_state(0.0, &policy), HealthState::Disabled);
        assert_eq!(derive_state(-1.0, &policy), HealthState::Disabled);

        let no_disable = HealthPolicy {
            auto_disable: false,
            ..policy
        };
        assert_eq!(derive_state(-1.0, &no_disable), HealthState::Degraded);
    }

    #[tokio::test]
    async fn test_missing_record_reads_as_full_healthy() {
        let store = InMemoryHealthStore::new();
        let record = store.get_record("fn-1", 0, &policy()).await.unwrap();
        assert_eq!(record.state, HealthState::Healthy);
        assert_eq!(record.tokens, 10_000.0);
    }

    #[tokio::test]
    async fn test_observe_floors_tokens() {
        let store = InMemoryHealthStore::new();
        let outcome = store
            .observe_and_transition(
                "fn-1",
                ObserveUpdate {
                    cost: 1_000_000,
                    now_ms: 0,
                },
                &policy(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.record.tokens, TOKEN_FLOOR);
        assert_eq!(outcome.record.state, HealthState::Disabled);
        assert_eq!(
            outcome.transition,
            Some((HealthState::Healthy, HealthState::Disabled))
        );
    }

    #[tokio::test]
    async fn test_locked_observation_updates_tokens_only() {
        let store = InMemoryHealthStore::new();
        let policy = policy();

        store
            .force_state("fn-1", HealthState::Healthy, policy.capacity, 0, 60_000)
            .await
            .unwrap();

        let outcome = store
            .observe_and_transition("fn-1", ObserveUpdate { cost: 9_999, now_ms: 1 }, &policy)
            .await
            .unwrap();

        // Debt accumulates but the state is left unchanged by the lock.
        assert_eq!(outcome.record.state, HealthState::Healthy);
        assert!(outcome.transition.is_none());
        assert!(outcome.record.tokens < 2.0);

        // After expiry the next observation re-evaluates.
        let outcome = store
            .observe_and_transition(
                "fn-1",
                ObserveUpdate {
                    cost: 1_000,
                    now_ms: 70_000,
                },
                &policy,
            )
            .await
            .unwrap();
        assert!(outcome.transition.is_some());
    }

    #[tokio::test]
    async fn test_read_time_refill_does_not_persist() {
        let store = InMemoryHealthStore::new();
        let policy = policy();

        store
            .observe_and_transition("fn-1", ObserveUpdate { cost: 120, now_ms: 0 }, &policy)
            .await
            .unwrap();

        let at_1s = store.get_record("fn-1", 1_000, &policy).await.unwrap();
        assert_eq!(at_1s.tokens, 9_890.0);

        // Reading did not advance the persisted refill timestamp.
        let again = store.get_record("fn-1", 1_000, &policy).await.unwrap();
        assert_eq!(again.tokens, 9_890.0);
    }

    #[tokio::test]
    async fn test_force_state_reports_previous_only_on_change() {
        let store = InMemoryHealthStore::new();

        let prev = store
            .force_state("fn-1", HealthState::Degraded, 8_000.0, 0, 60_000)
            .await
            .unwrap();
        assert_eq!(prev, Some(HealthState::Healthy));

        let prev = store
            .force_state("fn-1", HealthState::Degraded, 8_000.0, 1, 60_000)
            .await
            .unwrap();
        assert_eq!(prev, None);

        let ttl = store.lock_remaining_ms("fn-1", 2).await.unwrap();
        assert!(ttl.is_some());
    }
}
