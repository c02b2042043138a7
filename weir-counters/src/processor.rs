//! Predicate registry and per-event match counting.
//!
//! Predicates are opaque boolean matchers compiled elsewhere (the bytecode
//! evaluator is an external collaborator); this module only cares that each
//! registered action answers yes or no for a filter context, and turns
//! matches into pending counter updates.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use weir_core::clock::format_date;
use weir_core::Clock;
use weir_event::TeamId;

use crate::{
    filter_hash, BehavioralCounterStore, CounterKey, CounterStoreError, CounterUpdate,
};

/// The derived view of an event that predicates are evaluated against
#[derive(Debug, Clone)]
pub struct FilterContext {
    /// Event name
    pub event: String,

    /// Event properties
    pub properties: Value,
}

impl FilterContext {
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
}

/// An event queued for behavioral matching
#[derive(Debug, Clone)]
pub struct BehavioralEvent {
    pub team_id: TeamId,
    pub person_id: String,
    pub context: FilterContext,
}

/// Opaque boolean matcher
pub trait Predicate: Send + Sync {
    fn matches(&self, context: &FilterContext) -> Result<bool, PredicateError>;
}

impl<F> Predicate for F
where
    F: Fn(&FilterContext) -> Result<bool, PredicateError> + Send + Sync,
{
    fn matches(&self, context: &FilterContext) -> Result<bool, PredicateError> {
        self(context)
    }
}

/// Predicate evaluation errors. Treated as non-matches by the processor.
#[derive(Debug, Error)]
pub enum PredicateError {
    #[error("predicate evaluation failed: {0}")]
    Evaluation(String),
}

/// A registered action: a named predicate plus its canonical serialized
/// form, from which the counter filter hash is derived.
pub struct Action {
    pub id: i64,
    pub name: String,
    filter_hash: String,
    predicate: Arc<dyn Predicate>,
}

impl Action {
    pub fn new(id: i64, name: impl Into<String>, bytecode: &Value, predicate: Arc<dyn Predicate>) -> Self {
        Self {
            id,
            name: name.into(),
            filter_hash: filter_hash(bytecode),
            predicate,
        }
    }

    pub fn filter_hash(&self) -> &str {
        &self.filter_hash
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("filter_hash", &self.filter_hash)
            .finish()
    }
}

/// Per-tenant registry of actions
#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<AHashMap<TeamId, Vec<Arc<Action>>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, team_id: TeamId, action: Action) {
        self.actions
            .write()
            .entry(team_id)
            .or_default()
            .push(Arc::new(action));
    }

    pub fn actions_for_team(&self, team_id: TeamId) -> Vec<Arc<Action>> {
        self.actions
            .read()
            .get(&team_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.actions.write().clear();
    }
}

/// Evaluates registered predicates against events and writes behavioral
/// counters.
///
/// When the counter store is disabled by configuration (`store` is `None`)
/// matching still runs so match rates stay observable, but nothing is
/// persisted.
pub struct BehavioralEventProcessor {
    registry: Arc<ActionRegistry>,
    store: Option<Arc<dyn BehavioralCounterStore>>,
    clock: Arc<dyn Clock>,
}

impl BehavioralEventProcessor {
    pub fn new(
        registry: Arc<ActionRegistry>,
        store: Option<Arc<dyn BehavioralCounterStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
        }
    }

    /// Evaluate every action of the event's tenant; each match appends a
    /// pending update. Returns the number of matched actions.
    pub fn process_event(
        &self,
        event: &BehavioralEvent,
        pending: &mut Vec<CounterUpdate>,
    ) -> usize {
        let date = format_date(self.clock.now_ms());
        let mut matched = 0;

        for action in self.registry.actions_for_team(event.team_id) {
            match action.predicate.matches(&event.context) {
                Ok(true) => {
                    matched += 1;
                    pending.push(CounterUpdate {
                        key: CounterKey {
                            team_id: event.team_id,
                            filter_hash: action.filter_hash.clone(),
                            person_id: event.person_id.clone(),
                            date: date.clone(),
                        },
                    });
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        action_id = action.id,
                        team_id = event.team_id,
                        error = %e,
                        "Predicate evaluation failed, counting as non-match"
                    );
                }
            }
        }

        matched
    }

    /// Accumulate matches across a batch and perform one batched increment
    /// write. Returns the total match count.
    pub async fn process_batch(
        &self,
        events: &[BehavioralEvent],
    ) -> Result<usize, CounterStoreError> {
        let mut pending = Vec::new();
        let mut matched = 0;

        for event in events {
            matched += self.process_event(event, &mut pending);
        }

        if pending.is_empty() {
            return Ok(matched);
        }

        match &self.store {
            Some(store) => {
                store.increment_batch(&pending).await?;
                debug!(updates = pending.len(), "Wrote behavioral counters");
            }
            None => {
                debug!(
                    updates = pending.len(),
                    "Counter persistence disabled, skipping write"
                );
            }
        }

        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryCounterStore;
    use weir_core::MockClock;

    fn pageview_action(id: i64) -> Action {
        let bytecode = serde_json::json!(["_H", 1, 32, "$pageview", 32, "event", 1, 1, 11]);
        Action::new(
            id,
            "Pageview action",
            &bytecode,
            Arc::new(|ctx: &FilterContext| Ok(ctx.event == "$pageview")),
        )
    }

    fn chrome_pageview_action(id: i64) -> Action {
        let bytecode =
            serde_json::json!(["_H", 1, 32, "Chrome", 32, "$browser", 32, "properties", 1, 2, 11]);
        Action::new(
            id,
            "Chrome pageview action",
            &bytecode,
            Arc::new(|ctx: &FilterContext| {
                Ok(ctx.event == "$pageview"
                    && ctx.property("$browser").and_then(Value::as_str) == Some("Chrome"))
            }),
        )
    }

    fn event(name: &str, browser: &str) -> BehavioralEvent {
        BehavioralEvent {
            team_id: 2,
            person_id: "550e8400-e29b-41d4-a716-446655440000".to_string(),
            context: FilterContext {
                event: name.to_string(),
                properties: serde_json::json!({ "$browser": browser }),
            },
        }
    }

    struct Fixture {
        processor: BehavioralEventProcessor,
        registry: Arc<ActionRegistry>,
        store: Arc<InMemoryCounterStore>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ActionRegistry::new());
        let store = Arc::new(InMemoryCounterStore::new());
        let processor = BehavioralEventProcessor::new(
            registry.clone(),
            Some(store.clone()),
            Arc::new(MockClock::at(1_720_000_000_000)),
        );
        Fixture {
            processor,
            registry,
            store,
        }
    }

    fn counter_key(action: &Action) -> CounterKey {
        CounterKey {
            team_id: 2,
            filter_hash: action.filter_hash().to_string(),
            person_id: "550e8400-e29b-41d4-a716-446655440000".to_string(),
            date: "2024-07-03".to_string(),
        }
    }

    #[test]
    fn test_process_event_counts_matches() {
        let f = fixture();
        f.registry.register(2, chrome_pageview_action(1));

        let mut pending = Vec::new();
        assert_eq!(
            f.processor.process_event(&event("$pageview", "Chrome"), &mut pending),
            1
        );
        assert_eq!(pending.len(), 1);

        assert_eq!(
            f.processor.process_event(&event("$pageview", "Firefox"), &mut pending),
            0
        );
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_multiple_matching_actions() {
        let f = fixture();
        f.registry.register(2, pageview_action(1));
        f.registry.register(2, chrome_pageview_action(2));

        let mut pending = Vec::new();
        assert_eq!(
            f.processor.process_event(&event("$pageview", "Chrome"), &mut pending),
            2
        );
    }

    #[test]
    fn test_predicate_errors_count_as_non_match() {
        let f = fixture();
        f.registry.register(
            2,
            Action::new(
                1,
                "Broken",
                &serde_json::json!(["_H"]),
                Arc::new(|_: &FilterContext| {
                    Err(PredicateError::Evaluation("stack underflow".to_string()))
                }),
            ),
        );

        let mut pending = Vec::new();
        assert_eq!(
            f.processor.process_event(&event("$pageview", "Chrome"), &mut pending),
            0
        );
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_two_qualifying_events_store_count_of_two() {
        let f = fixture();
        let action = pageview_action(1);
        let key = counter_key(&action);
        f.registry.register(2, action);

        let events = vec![event("$pageview", "Chrome"), event("$pageview", "Firefox")];
        assert_eq!(f.processor.process_batch(&events).await.unwrap(), 2);

        assert_eq!(f.store.get_counter(&key).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_non_matching_event_leaves_key_absent() {
        let f = fixture();
        let action = pageview_action(1);
        let key = counter_key(&action);
        f.registry.register(2, action);

        let events = vec![event("$autocapture", "Chrome")];
        assert_eq!(f.processor.process_batch(&events).await.unwrap(), 0);

        assert_eq!(f.store.get_counter(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_disabled_store_still_matches() {
        let registry = Arc::new(ActionRegistry::new());
        let processor = BehavioralEventProcessor::new(
            registry.clone(),
            None,
            Arc::new(MockClock::at(1_720_000_000_000)),
        );
        registry.register(2, pageview_action(1));

        let events = vec![event("$pageview", "Chrome")];
        assert_eq!(processor.process_batch(&events).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_redelivery_is_monotonically_non_decreasing() {
        let f = fixture();
        let action = pageview_action(1);
        let key = counter_key(&action);
        f.registry.register(2, action);

        let events = vec![event("$pageview", "Chrome")];
        f.processor.process_batch(&events).await.unwrap();
        let first = f.store.get_counter(&key).await.unwrap().unwrap();

        // At-least-once redelivery double-counts but never regresses.
        f.processor.process_batch(&events).await.unwrap();
        let second = f.store.get_counter(&key).await.unwrap().unwrap();
        assert!(second >= first);
    }
}
