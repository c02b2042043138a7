//! Overflow and testing-topic routing.
//!
//! Hot identities are detected with a per-key token bucket charged one
//! token per event. A denied group is redirected wholesale to the overflow
//! topic, where a dedicated consumer processes it without holding up the
//! main topic's partitions. A configured testing topic preempts everything:
//! the consumer becomes a mirror and processes nothing locally.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{error, warn};

use weir_core::clock::format_rfc3339;
use weir_core::{BackgroundScheduler, Clock, MemoryRateLimiter};
use weir_event::{Breadcrumb, EventsForKey, OutboundMessage, RawMessage};

use crate::config::ConsumerConfig;
use crate::metrics::PipelineMetrics;
use crate::producer::MessageProducer;
use crate::restrictions::EventRestrictionManager;

/// One overflow warning per key per hour
const WARNING_BUCKET_CAPACITY: f64 = 1.0;
const WARNING_REFILL_PER_SEC: f64 = 1.0 / 3600.0;

/// Decides, per group, whether to process locally or redirect
pub struct OverflowRouter {
    overflow_topic: Option<String>,
    testing_topic: Option<String>,
    preserve_partition_locality: bool,
    consumer_id: String,
    limiter: MemoryRateLimiter,
    warning_limiter: MemoryRateLimiter,
    restrictions: Arc<EventRestrictionManager>,
    producer: Arc<dyn MessageProducer>,
    scheduler: BackgroundScheduler,
    metrics: Arc<PipelineMetrics>,
    clock: Arc<dyn Clock>,
}

impl OverflowRouter {
    pub fn new(
        config: &ConsumerConfig,
        restrictions: Arc<EventRestrictionManager>,
        producer: Arc<dyn MessageProducer>,
        scheduler: BackgroundScheduler,
        metrics: Arc<PipelineMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        // Routing overflow back to the input topic would loop events
        // straight into this consumer again; treat that as disabled.
        let overflow_topic = config
            .overflow_topic
            .clone()
            .filter(|topic| *topic != config.input_topic);
        if overflow_topic.is_none() && config.overflow_topic.is_some() {
            warn!(
                topic = %config.input_topic,
                "Overflow topic equals input topic, overflow routing disabled"
            );
        }

        Self {
            overflow_topic,
            testing_topic: config.testing_topic.clone(),
            preserve_partition_locality: config.preserve_partition_locality,
            consumer_id: config.group_id.clone(),
            limiter: MemoryRateLimiter::new(
                config.overflow_bucket_capacity,
                config.overflow_refill_per_sec,
            ),
            warning_limiter: MemoryRateLimiter::new(
                WARNING_BUCKET_CAPACITY,
                WARNING_REFILL_PER_SEC,
            ),
            restrictions,
            producer,
            scheduler,
            metrics,
            clock,
        }
    }

    pub fn overflow_enabled(&self) -> bool {
        self.overflow_topic.is_some()
    }

    /// Split a batch's groups into those processed locally and those
    /// redirected. Redirection happens asynchronously through the
    /// background scheduler; the returned groups are the local remainder.
    pub fn route_groups(&self, groups: Vec<EventsForKey>) -> Vec<EventsForKey> {
        let mut kept = Vec::with_capacity(groups.len());

        for group in groups {
            // Mirror mode wins over everything else.
            if let Some(testing_topic) = &self.testing_topic {
                self.metrics
                    .events_mirrored
                    .fetch_add(group.events.len() as u64, Ordering::Relaxed);
                self.redirect(group, testing_topic.clone(), true);
                continue;
            }

            let Some(overflow_topic) = &self.overflow_topic else {
                kept.push(group);
                continue;
            };

            let key = group.key();
            let forced = self
                .restrictions
                .should_force_overflow(&group.token, Some(&group.distinct_id));

            if forced {
                // Forced keys keep locality as long as person processing
                // still applies to them; once it is skipped, fall back to
                // whatever the consumer is configured to do.
                let skip_person = self
                    .restrictions
                    .should_skip_person(&group.token, Some(&group.distinct_id));
                let preserve_locality = if skip_person {
                    self.preserve_partition_locality
                } else {
                    true
                };
                self.metrics
                    .events_force_overflowed
                    .fetch_add(group.events.len() as u64, Ordering::Relaxed);
                self.metrics
                    .events_overflowed
                    .fetch_add(group.events.len() as u64, Ordering::Relaxed);
                self.redirect(group, overflow_topic.clone(), preserve_locality);
                continue;
            }

            // Admission is judged at the group's first message; refill never
            // gets credit for time that passed within the group itself.
            let at_ms = group
                .events
                .first()
                .map(|e| e.message.timestamp_ms)
                .unwrap_or_else(|| self.clock.now_ms());

            if self.limiter.consume(&key, group.events.len() as f64, at_ms) {
                kept.push(group);
                continue;
            }

            if self.warning_limiter.consume(&key, 1.0, at_ms) {
                warn!(
                    key = %key,
                    events = group.events.len(),
                    "Hot key routed to overflow"
                );
            }
            self.metrics
                .events_overflowed
                .fetch_add(group.events.len() as u64, Ordering::Relaxed);
            self.redirect(group, overflow_topic.clone(), self.preserve_partition_locality);
        }

        kept
    }

    /// Re-publish a group's raw messages with a fresh breadcrumb appended.
    /// Runs off the critical path; a batch only waits for it at drain time.
    fn redirect(&self, group: EventsForKey, topic: String, preserve_locality: bool) {
        let messages: Vec<OutboundMessage> = group
            .events
            .iter()
            .map(|e| self.to_outbound(&e.message, &topic, preserve_locality))
            .collect();

        let producer = self.producer.clone();
        self.scheduler.schedule(async move {
            for message in messages {
                let topic = message.topic.clone();
                if let Err(e) = producer.produce(message).await {
                    error!(topic = %topic, error = %e, "Failed to redirect message");
                }
            }
        });
    }

    fn to_outbound(
        &self,
        message: &RawMessage,
        topic: &str,
        preserve_locality: bool,
    ) -> OutboundMessage {
        let mut breadcrumbs = Breadcrumb::from_headers(message);
        breadcrumbs.push(Breadcrumb {
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            processed_at: format_rfc3339(self.clock.now_ms()),
            consumer_id: self.consumer_id.clone(),
        });

        let mut headers: Vec<(String, Vec<u8>)> = message.headers.to_vec();
        Breadcrumb::attach(&mut headers, &breadcrumbs);

        OutboundMessage {
            topic: topic.to_string(),
            // A `None` key spreads the hot identity across partitions.
            key: if preserve_locality {
                message.key.clone()
            } else {
                None
            },
            value: message.value.clone(),
            headers,
        }
    }
}
