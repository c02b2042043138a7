//! Function health watcher.
//!
//! Distributed token-bucket circuit breaker per processing function, backed
//! by the shared [`HealthStore`]. Each batch of invocation results charges
//! an aggregated cost against the function's budget; crossing a threshold
//! moves the function to a worse state and fires exactly one notification,
//! rate-limited by a short-TTL state-change lock.

use std::sync::Arc;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::cost::{CostModel, CostModelConfig, CostModelError, InvocationResult};
use crate::health::{
    HealthPolicy, HealthRecord, HealthState, HealthStore, ObserveUpdate, StoreError,
};

/// Watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Token bucket capacity per function
    pub bucket_capacity: u64,

    /// Tokens refilled per second
    pub refill_per_sec: f64,

    /// Remaining-token ratio above which a function is healthy
    pub degraded_ratio: f64,

    /// Whether exhausted functions are disabled automatically
    pub auto_disable: bool,

    /// Cooldown between persisted state changes
    pub state_lock_ttl: Duration,

    /// Per-kind invocation cost bounds
    pub cost_model: CostModelConfig,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            bucket_capacity: 10_000,
            refill_per_sec: 10.0,
            degraded_ratio: 0.8,
            auto_disable: true,
            state_lock_ttl: Duration::from_secs(60),
            cost_model: CostModelConfig::default(),
        }
    }
}

/// Display metadata for a processing function, used in notifications and
/// audit events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub id: String,
    pub team_id: i64,
    pub name: String,
    pub template_id: Option<String>,
}

/// A persisted state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub function_id: String,
    pub previous_state: HealthState,
    pub state: HealthState,
}

/// Sink for external audit events emitted on administrative state changes
pub trait AuditSink: Send + Sync {
    fn state_change(&self, function: &FunctionInfo, state: HealthState, previous: HealthState);
}

/// Audit sink that drops everything
#[derive(Debug, Default)]
pub struct NoOpAuditSink;

impl AuditSink for NoOpAuditSink {
    fn state_change(&self, _function: &FunctionInfo, _state: HealthState, _previous: HealthState) {}
}

/// Distributed circuit breaker for processing functions
pub struct HealthWatcher {
    config: WatcherConfig,
    cost_model: CostModel,
    store: Arc<dyn HealthStore>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    cached_states: RwLock<AHashMap<String, HealthState>>,
}

impl HealthWatcher {
    /// Create a watcher. Fails fast on invalid cost-model bounds, before
    /// any traffic is accepted.
    pub fn new(
        config: WatcherConfig,
        store: Arc<dyn HealthStore>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, CostModelError> {
        let cost_model = CostModel::new(&config.cost_model)?;
        Ok(Self {
            config,
            cost_model,
            store,
            clock,
            audit,
            cached_states: RwLock::new(AHashMap::new()),
        })
    }

    fn policy(&self) -> HealthPolicy {
        HealthPolicy {
            capacity: self.config.bucket_capacity as f64,
            refill_per_sec: self.config.refill_per_sec,
            degraded_ratio: self.config.degraded_ratio,
            auto_disable: self.config.auto_disable,
            lock_ttl_ms: self.config.state_lock_ttl.as_millis() as u64,
        }
    }

    /// Tokens a function holds immediately after being forced into a state
    fn threshold_tokens(&self, state: HealthState) -> f64 {
        let capacity = self.config.bucket_capacity as f64;
        match state {
            HealthState::Healthy => capacity,
            HealthState::Degraded => capacity * self.config.degraded_ratio,
            HealthState::Disabled => 0.0,
        }
    }

    /// Charge a batch of invocation results against their functions'
    /// budgets, aggregating cost per function id first, then applying each
    /// aggregate atomically against the shared store. Returns the state
    /// changes that were persisted.
    pub async fn observe_results(
        &self,
        results: &[InvocationResult],
    ) -> Result<Vec<StateChange>, StoreError> {
        let mut costs: AHashMap<&str, u64> = AHashMap::new();
        for result in results {
            *costs.entry(result.function_id.as_str()).or_default() +=
                self.cost_model.cost_for_invocation(result);
        }

        let policy = self.policy();
        let now_ms = self.clock.now_ms();
        let mut changes = Vec::new();

        for (function_id, cost) in costs {
            let outcome = self
                .store
                .observe_and_transition(function_id, ObserveUpdate { cost, now_ms }, &policy)
                .await?;

            debug!(
                function_id,
                cost,
                tokens = outcome.record.tokens,
                state = outcome.record.state.as_str(),
                "Observed function results"
            );

            if let Some((previous, state)) = outcome.transition {
                info!(
                    function_id,
                    previous_state = previous.as_str(),
                    state = state.as_str(),
                    "Function health state changed"
                );
                changes.push(StateChange {
                    function_id: function_id.to_string(),
                    previous_state: previous,
                    state,
                });
            }
        }

        Ok(changes)
    }

    /// Read a function's persisted record, with read-time lazy refill
    pub async fn get_persisted_state(&self, function_id: &str) -> Result<HealthRecord, StoreError> {
        self.store
            .get_record(function_id, self.clock.now_ms(), &self.policy())
            .await
    }

    /// Administrative path forcing states regardless of token arithmetic.
    ///
    /// The state-change lock is refreshed, not consulted: operators must be
    /// able to override a cooling-down function. Tokens are reset to the
    /// target state's threshold so the next observations start from a
    /// consistent balance. One notification per actual change; with
    /// `capture` set an audit event with the function's display metadata is
    /// emitted as well.
    pub async fn do_state_changes(
        &self,
        changes: &[(FunctionInfo, HealthState)],
        capture: bool,
    ) -> Result<Vec<StateChange>, StoreError> {
        let now_ms = self.clock.now_ms();
        let lock_ttl_ms = self.config.state_lock_ttl.as_millis() as u64;
        let mut applied = Vec::new();

        for (function, state) in changes {
            let previous = self
                .store
                .force_state(
                    &function.id,
                    *state,
                    self.threshold_tokens(*state),
                    now_ms,
                    lock_ttl_ms,
                )
                .await?;

            let Some(previous) = previous else {
                continue;
            };

            info!(
                function_id = %function.id,
                team_id = function.team_id,
                previous_state = previous.as_str(),
                state = state.as_str(),
                "Function health state forced"
            );

            if capture {
                self.audit.state_change(function, *state, previous);
            }

            applied.push(StateChange {
                function_id: function.id.clone(),
                previous_state: previous,
                state: *state,
            });
        }

        Ok(applied)
    }

    /// Drop the state-change lock for a function
    pub async fn clear_lock(&self, function_id: &str) -> Result<(), StoreError> {
        self.store.clear_lock(function_id).await
    }

    /// Pre-fetch and cache states for a set of functions so per-event
    /// lookups are avoided. Replaces any previously cached snapshot.
    pub async fn fetch_and_cache_states(&self, function_ids: &[String]) -> Result<(), StoreError> {
        let unique: AHashSet<&String> = function_ids.iter().collect();
        let mut snapshot = AHashMap::with_capacity(unique.len());

        for id in unique {
            let record = self.get_persisted_state(id).await?;
            snapshot.insert(id.clone(), record.state);
        }

        if snapshot.values().any(|s| *s == HealthState::Disabled) {
            warn!("Cached function states include disabled functions");
        }

        *self.cached_states.write() = snapshot;
        Ok(())
    }

    /// Cached state from the last pre-fetch, if any
    pub fn cached_state(&self, function_id: &str) -> Option<HealthState> {
        self.cached_states.read().get(function_id).copied()
    }

    /// Drop the cached snapshot
    pub fn clear_cached_states(&self) {
        self.cached_states.write().clear();
    }
}
