//! Tenant transform functions.
//!
//! Each tenant can register a chain of opaque transform functions that run
//! against its events in order. Functions report per-segment timings, which
//! are charged against their health budget after the batch completes;
//! functions the watcher has disabled are skipped entirely.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use weir_core::{FunctionInfo, HealthState, HealthWatcher, InvocationResult, StateChange,
    StoreError, Timing};
use weir_event::{EventWithTeam, PipelineEvent, TeamId};

/// What a transform did with an event
pub struct TransformOutcome {
    /// The transformed event, or `None` to drop it
    pub event: Option<PipelineEvent>,

    /// Timed segments of this invocation
    pub timings: Vec<Timing>,
}

/// A transform failure. The event continues unchanged.
#[derive(Debug, Error)]
#[error("transform failed: {0}")]
pub struct TransformError(pub String);

/// An opaque per-tenant transform
pub trait TransformFunction: Send + Sync {
    fn info(&self) -> &FunctionInfo;

    fn apply(&self, event: &PipelineEvent) -> Result<TransformOutcome, TransformError>;
}

/// Runs tenant transform chains and accumulates their invocation results
/// for the health watcher.
pub struct TransformerService {
    functions: RwLock<AHashMap<TeamId, Vec<Arc<dyn TransformFunction>>>>,
    watcher: Arc<HealthWatcher>,
    pending: Mutex<Vec<InvocationResult>>,
}

impl TransformerService {
    pub fn new(watcher: Arc<HealthWatcher>) -> Self {
        Self {
            functions: RwLock::new(AHashMap::new()),
            watcher,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, team_id: TeamId, function: Arc<dyn TransformFunction>) {
        self.functions
            .write()
            .entry(team_id)
            .or_default()
            .push(function);
    }

    /// Ids of every function registered for the given tenants
    pub fn function_ids_for_teams(&self, team_ids: &[TeamId]) -> Vec<String> {
        let unique: AHashSet<TeamId> = team_ids.iter().copied().collect();
        let functions = self.functions.read();
        unique
            .iter()
            .filter_map(|team_id| functions.get(team_id))
            .flatten()
            .map(|f| f.info().id.clone())
            .collect()
    }

    /// Run a tenant's transform chain over one event. Returns `None` when a
    /// transform dropped the event. Failures keep the event unchanged.
    pub fn transform_event(
        &self,
        team_id: TeamId,
        mut event: PipelineEvent,
    ) -> Option<PipelineEvent> {
        let chain = match self.functions.read().get(&team_id) {
            Some(functions) => functions.clone(),
            None => return Some(event),
        };

        for function in chain {
            let info = function.info();
            if self.watcher.cached_state(&info.id) == Some(HealthState::Disabled) {
                debug!(function_id = %info.id, team_id, "Skipping disabled transform");
                continue;
            }

            match function.apply(&event) {
                Ok(outcome) => {
                    if !outcome.timings.is_empty() {
                        self.pending.lock().push(InvocationResult {
                            function_id: info.id.clone(),
                            timings: outcome.timings,
                        });
                    }
                    match outcome.event {
                        Some(transformed) => event = transformed,
                        None => {
                            debug!(
                                function_id = %info.id,
                                team_id,
                                "Transform dropped event"
                            );
                            return None;
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        function_id = %info.id,
                        team_id,
                        error = %e,
                        "Transform failed, keeping event unchanged"
                    );
                }
            }
        }

        Some(event)
    }

    /// Run every event through its tenant's chain, dropping what the chains
    /// drop.
    pub fn transform_batch(&self, events: Vec<EventWithTeam>) -> Vec<EventWithTeam> {
        events
            .into_iter()
            .filter_map(|e| {
                let EventWithTeam {
                    message,
                    event,
                    team,
                    skip_person,
                } = e;
                self.transform_event(team.id, event)
                    .map(|event| EventWithTeam {
                        message,
                        event,
                        team,
                        skip_person,
                    })
            })
            .collect()
    }

    /// Charge accumulated invocation results against function budgets.
    /// Runs after the batch, off the critical path.
    pub async fn process_invocation_results(&self) -> Result<Vec<StateChange>, StoreError> {
        let results = std::mem::take(&mut *self.pending.lock());
        if results.is_empty() {
            return Ok(Vec::new());
        }
        self.watcher.observe_results(&results).await
    }

    /// Number of invocation results not yet charged
    pub fn pending_results(&self) -> usize {
        self.pending.lock().len()
    }
}
