//! The batch orchestrator.
//!
//! One `handle_batch` call owns one batch end to end: preprocess, tenant
//! transforms, per-identity grouping, overflow routing, concurrent group
//! processing with per-event retries and dead-lettering, then a single
//! flush of person/group changes and behavioral counters before the batch
//! can be acknowledged. Redirects, dedup recording and health budget
//! charging run in the background and are only awaited at drain time.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use weir_core::{
    retry_if_retriable, AuditSink, BackgroundScheduler, Clock, CostModelError, HealthStore,
    HealthWatcher, Retriable,
};
use weir_counters::{
    ActionRegistry, BehavioralCounterStore, BehavioralEvent, BehavioralEventProcessor,
    FilterContext,
};
use weir_event::{EventWithTeam, OutboundMessage, RawMessage};

use crate::config::ConsumerConfig;
use crate::grouper::group_events_by_key;
use crate::metrics::PipelineMetrics;
use crate::preprocess::{Preprocessor, TeamResolver};
use crate::producer::{MessageProducer, ProduceError};
use crate::restrictions::EventRestrictionManager;
use crate::router::OverflowRouter;
use crate::stores::{BatchStore, DeduplicationStore, IngestionWarningSink};
use crate::transformer::TransformerService;
use crate::PipelineError;

/// Header naming the failed event on dead-lettered messages
const EVENT_ID_HEADER: &str = "event-id";

/// External collaborators of the consumer
pub struct IngestionDeps {
    pub resolver: Arc<dyn TeamResolver>,
    pub producer: Arc<dyn MessageProducer>,
    pub person_store: Arc<dyn BatchStore>,
    pub group_store: Arc<dyn BatchStore>,
    pub dedup: Arc<dyn DeduplicationStore>,
    pub warnings: Arc<dyn IngestionWarningSink>,
    pub health_store: Arc<dyn HealthStore>,
    pub audit: Arc<dyn AuditSink>,
    pub counter_store: Option<Arc<dyn BehavioralCounterStore>>,
    pub actions: Arc<ActionRegistry>,
    pub clock: Arc<dyn Clock>,
}

/// Outcome of one processed batch
pub struct BatchResult {
    /// Deferred work spawned by this batch: redirects, dedup recording and
    /// health budget charging. Await it (or `drain`) before shutdown.
    pub background: tokio::task::JoinHandle<()>,

    /// Events fully processed locally
    pub events_processed: usize,
}

/// Batch consumer for the main events topic
pub struct IngestionConsumer {
    config: ConsumerConfig,
    restrictions: Arc<EventRestrictionManager>,
    preprocessor: Preprocessor,
    router: OverflowRouter,
    transformer: Arc<TransformerService>,
    watcher: Arc<HealthWatcher>,
    behavioral: BehavioralEventProcessor,
    person_store: Arc<dyn BatchStore>,
    group_store: Arc<dyn BatchStore>,
    dedup: Arc<dyn DeduplicationStore>,
    producer: Arc<dyn MessageProducer>,
    scheduler: BackgroundScheduler,
    metrics: Arc<PipelineMetrics>,
}

impl IngestionConsumer {
    /// Wire up a consumer. Fails fast on invalid watcher configuration.
    pub fn new(config: ConsumerConfig, deps: IngestionDeps) -> Result<Self, CostModelError> {
        let metrics = Arc::new(PipelineMetrics::new());
        let scheduler = BackgroundScheduler::new();
        let restrictions = Arc::new(EventRestrictionManager::new(
            &config.drop_events,
            &config.skip_person,
            &config.force_overflow,
        ));

        let watcher = Arc::new(HealthWatcher::new(
            config.watcher.clone(),
            deps.health_store,
            deps.clock.clone(),
            deps.audit,
        )?);
        let transformer = Arc::new(TransformerService::new(watcher.clone()));

        let preprocessor = Preprocessor::new(
            restrictions.clone(),
            deps.resolver,
            deps.warnings,
            metrics.clone(),
            deps.clock.clone(),
        );
        let router = OverflowRouter::new(
            &config,
            restrictions.clone(),
            deps.producer.clone(),
            scheduler.clone(),
            metrics.clone(),
            deps.clock.clone(),
        );
        let counter_store = if config.counters_enabled {
            deps.counter_store
        } else {
            None
        };
        let behavioral =
            BehavioralEventProcessor::new(deps.actions, counter_store, deps.clock.clone());

        Ok(Self {
            config,
            restrictions,
            preprocessor,
            router,
            transformer,
            watcher,
            behavioral,
            person_store: deps.person_store,
            group_store: deps.group_store,
            dedup: deps.dedup,
            producer: deps.producer,
            scheduler,
            metrics,
        })
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn transformer(&self) -> &TransformerService {
        &self.transformer
    }

    pub fn watcher(&self) -> &HealthWatcher {
        &self.watcher
    }

    pub fn restrictions(&self) -> &EventRestrictionManager {
        &self.restrictions
    }

    /// Process one batch. An `Err` means the batch must not be acknowledged
    /// and will be redelivered; everything already flushed is covered by
    /// at-least-once semantics downstream.
    pub async fn handle_batch(&self, messages: Vec<RawMessage>) -> Result<BatchResult, PipelineError> {
        if self.config.batch_start_logging {
            self.log_batch_start(&messages);
        }

        let events = self.preprocessor.preprocess(&messages).await?;
        self.record_dedup_keys(&events);

        // Refresh the function state cache before any transform consults it.
        if rand::random::<f64>() < self.config.watcher_sample_rate {
            self.refresh_cached_states(&events).await?;
        }

        let before_transforms = events.len();
        let events = self.transformer.transform_batch(events);
        let transform_drops = (before_transforms - events.len()) as u64;
        if transform_drops > 0 {
            self.metrics
                .events_dropped
                .fetch_add(transform_drops, Ordering::Relaxed);
        }

        let groups = self.router.route_groups(group_events_by_key(events));

        let behavioral_pending: Mutex<Vec<BehavioralEvent>> = Mutex::new(Vec::new());
        let mut events_processed = 0;

        // Groups run concurrently; events within a group strictly in order.
        let group_results = futures::future::join_all(groups.into_iter().map(|group| {
            let pending = &behavioral_pending;
            async move {
                let mut processed = 0;
                for event in group.events {
                    self.process_event(event, pending).await?;
                    processed += 1;
                }
                Ok::<usize, PipelineError>(processed)
            }
        }))
        .await;
        for result in group_results {
            events_processed += result?;
        }

        self.flush(behavioral_pending.into_inner()).await?;

        self.metrics.batches_processed.fetch_add(1, Ordering::Relaxed);
        debug!(events_processed, "Batch processed");

        let scheduler = self.scheduler.clone();
        let transformer = self.transformer.clone();
        let background = tokio::spawn(async move {
            scheduler.wait_for_all().await;
            match transformer.process_invocation_results().await {
                Ok(changes) if !changes.is_empty() => {
                    info!(changes = changes.len(), "Function health states changed")
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Failed to charge function budgets"),
            }
        });

        Ok(BatchResult {
            background,
            events_processed,
        })
    }

    /// Await every background task spawned so far
    pub async fn drain(&self) {
        self.scheduler.wait_for_all().await;
    }

    fn log_batch_start(&self, messages: &[RawMessage]) {
        let mut first_offsets: AHashMap<i32, i64> = AHashMap::new();
        for message in messages {
            first_offsets
                .entry(message.partition)
                .and_modify(|o| *o = (*o).min(message.offset))
                .or_insert(message.offset);
        }
        info!(
            messages = messages.len(),
            ?first_offsets,
            "Starting batch"
        );
    }

    /// Dedup recording is best effort and never blocks the batch
    fn record_dedup_keys(&self, events: &[EventWithTeam]) {
        if events.is_empty() {
            return;
        }
        let keys: Vec<String> = events
            .iter()
            .map(|e| {
                format!(
                    "{}:{}:{}",
                    e.team.id,
                    e.event.distinct_id.as_deref().unwrap_or(""),
                    e.event.uuid
                )
            })
            .collect();
        let dedup = self.dedup.clone();
        self.scheduler.schedule(async move {
            match dedup.record_batch(keys).await {
                Ok(duplicates) if duplicates > 0 => {
                    debug!(duplicates, "Duplicate events in batch")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to record dedup keys"),
            }
        });
    }

    async fn refresh_cached_states(&self, events: &[EventWithTeam]) -> Result<(), PipelineError> {
        let team_ids: Vec<i64> = events
            .iter()
            .map(|e| e.team.id)
            .collect::<AHashSet<_>>()
            .into_iter()
            .collect();
        let function_ids = self.transformer.function_ids_for_teams(&team_ids);
        if function_ids.is_empty() {
            return Ok(());
        }
        self.watcher.clear_cached_states();
        self.watcher.fetch_and_cache_states(&function_ids).await?;
        Ok(())
    }

    /// Process one event with in-place retries. A still-failing transient
    /// error fails the batch; an event-scoped failure dead-letters just this
    /// event.
    async fn process_event(
        &self,
        event: EventWithTeam,
        pending: &Mutex<Vec<BehavioralEvent>>,
    ) -> Result<(), PipelineError> {
        match retry_if_retriable(|| self.apply_event(&event)).await {
            Ok(()) => {
                pending.lock().push(to_behavioral(&event));
                self.metrics.events_ingested.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_offset(
                    &event.message.topic,
                    event.message.partition,
                    event.message.offset,
                    event.message.timestamp_ms,
                );
                Ok(())
            }
            Err(e) if e.is_retriable() => Err(e),
            Err(e) => self.dead_letter(&event, &e).await,
        }
    }

    /// The per-event state writes. Must stay idempotent under retries.
    async fn apply_event(&self, event: &EventWithTeam) -> Result<(), PipelineError> {
        if !event.skip_person {
            let distinct_id = event.event.distinct_id.as_deref().unwrap_or("");
            let set = event
                .event
                .properties
                .get("$set")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({}));
            self.person_store
                .upsert(event.team.id, distinct_id, set)
                .await?;
        }

        if event.event.event == "$groupidentify" {
            let Some(group_key) = event
                .event
                .properties
                .get("$group_key")
                .and_then(|v| v.as_str())
            else {
                return Err(PipelineError::Event(
                    "$groupidentify without $group_key".to_string(),
                ));
            };
            let set = event
                .event
                .properties
                .get("$group_set")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({}));
            self.group_store
                .upsert(event.team.id, group_key, set)
                .await?;
        }

        Ok(())
    }

    /// Send a failed event to the dead letter topic. A transient produce
    /// failure propagates and fails the batch; a rejected message is logged
    /// and given up on, since redelivery would reject it again.
    async fn dead_letter(
        &self,
        event: &EventWithTeam,
        cause: &PipelineError,
    ) -> Result<(), PipelineError> {
        warn!(
            team_id = event.team.id,
            uuid = %event.event.uuid,
            error = %cause,
            "Dead-lettering event"
        );

        let message = &event.message;
        let mut headers: Vec<(String, Vec<u8>)> = message.headers.to_vec();
        headers.push((
            EVENT_ID_HEADER.to_string(),
            event.event.uuid.clone().into_bytes(),
        ));

        let outbound = OutboundMessage {
            topic: self.config.dlq_topic.clone(),
            key: message.key.clone(),
            value: message.value.clone(),
            headers,
        };

        match self.producer.produce(outbound).await {
            Ok(()) => {
                self.metrics
                    .events_dead_lettered
                    .fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e @ ProduceError::Unavailable(_)) => Err(e.into()),
            Err(e @ ProduceError::Rejected(_)) => {
                error!(uuid = %event.event.uuid, error = %e, "Dead letter rejected, dropping event");
                Ok(())
            }
        }
    }

    /// Once-per-batch flush: person and group change messages, behavioral
    /// counters, then the producer itself.
    async fn flush(&self, behavioral: Vec<BehavioralEvent>) -> Result<(), PipelineError> {
        let mut outbound = self.person_store.flush().await?;
        outbound.extend(self.group_store.flush().await?);

        for message in outbound {
            match self.producer.produce(message).await {
                Ok(()) => {}
                Err(e @ ProduceError::Unavailable(_)) => return Err(e.into()),
                Err(e @ ProduceError::Rejected(_)) => {
                    // An oversize record cannot succeed on redelivery either.
                    warn!(error = %e, "State change message rejected, skipping");
                }
            }
        }

        self.behavioral.process_batch(&behavioral).await?;

        self.producer
            .flush()
            .await
            .map_err(PipelineError::from)
    }
}

fn to_behavioral(event: &EventWithTeam) -> BehavioralEvent {
    BehavioralEvent {
        team_id: event.team.id,
        person_id: event.event.distinct_id.clone().unwrap_or_default(),
        context: FilterContext {
            event: event.event.event.clone(),
            properties: event.event.properties.clone(),
        },
    }
}
