//! Outbound message production.
//!
//! The pipeline only needs produce-and-flush; the trait keeps the broker
//! client out of this crate and gives tests an inspectable double with
//! per-topic failure injection.

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use weir_core::Retriable;
use weir_event::OutboundMessage;

/// Errors surfaced by a producer
#[derive(Debug, Error)]
pub enum ProduceError {
    /// Broker unreachable or backpressured; safe to retry
    #[error("producer unavailable: {0}")]
    Unavailable(String),

    /// Broker rejected this specific message (typically size); retrying
    /// the same payload cannot succeed
    #[error("message rejected: {0}")]
    Rejected(String),
}

impl Retriable for ProduceError {
    fn is_retriable(&self) -> bool {
        matches!(self, ProduceError::Unavailable(_))
    }
}

impl From<ProduceError> for crate::PipelineError {
    fn from(e: ProduceError) -> Self {
        match e {
            ProduceError::Unavailable(m) => crate::PipelineError::Transient(m),
            ProduceError::Rejected(m) => crate::PipelineError::Event(m),
        }
    }
}

/// Sink for outbound messages
#[async_trait]
pub trait MessageProducer: Send + Sync {
    /// Enqueue one message for delivery
    async fn produce(&self, message: OutboundMessage) -> Result<(), ProduceError>;

    /// Block until every enqueued message is acknowledged
    async fn flush(&self) -> Result<(), ProduceError>;
}

/// Failure mode injected per topic in tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Unavailable,
    Rejected,
}

/// In-process producer used in tests and single-node deployments
#[derive(Debug, Default)]
pub struct InMemoryProducer {
    messages: Mutex<Vec<OutboundMessage>>,
    failures: Mutex<ahash::AHashMap<String, InjectedFailure>>,
}

impl InMemoryProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message produced so far, in production order
    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.messages.lock().clone()
    }

    /// Messages produced to one topic
    pub fn messages_for_topic(&self, topic: &str) -> Vec<OutboundMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Make every produce to `topic` fail with the given mode
    pub fn fail_topic(&self, topic: &str, failure: InjectedFailure) {
        self.failures.lock().insert(topic.to_string(), failure);
    }

    /// Clear an injected failure
    pub fn heal_topic(&self, topic: &str) {
        self.failures.lock().remove(topic);
    }
}

#[async_trait]
impl MessageProducer for InMemoryProducer {
    async fn produce(&self, message: OutboundMessage) -> Result<(), ProduceError> {
        if let Some(failure) = self.failures.lock().get(&message.topic) {
            return match failure {
                InjectedFailure::Unavailable => {
                    Err(ProduceError::Unavailable(format!("{} down", message.topic)))
                }
                InjectedFailure::Rejected => Err(ProduceError::Rejected(format!(
                    "message too large for {}",
                    message.topic
                ))),
            };
        }
        self.messages.lock().push(message);
        Ok(())
    }

    async fn flush(&self) -> Result<(), ProduceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str) -> OutboundMessage {
        OutboundMessage {
            topic: topic.to_string(),
            key: None,
            value: b"{}".to_vec(),
            headers: vec![],
        }
    }

    #[tokio::test]
    async fn test_produce_and_filter_by_topic() {
        let producer = InMemoryProducer::new();
        producer.produce(message("a")).await.unwrap();
        producer.produce(message("b")).await.unwrap();
        producer.produce(message("a")).await.unwrap();

        assert_eq!(producer.messages().len(), 3);
        assert_eq!(producer.messages_for_topic("a").len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let producer = InMemoryProducer::new();
        producer.fail_topic("a", InjectedFailure::Unavailable);

        let err = producer.produce(message("a")).await.unwrap_err();
        assert!(err.is_retriable());

        producer.fail_topic("a", InjectedFailure::Rejected);
        let err = producer.produce(message("a")).await.unwrap_err();
        assert!(!err.is_retriable());

        producer.heal_topic("a");
        producer.produce(message("a")).await.unwrap();
        assert_eq!(producer.messages_for_topic("a").len(), 1);
    }
}
