//! Weir Ingestion Pipeline
//!
//! Batch consumption from the durable event log: parsing and restriction
//! policy, tenant resolution, per-identity grouping, overflow routing,
//! tenant transform functions guarded by the function health watcher,
//! person and group state writes, behavioral counters, and dead-lettering.
//!
//! The orchestrator is [`IngestionConsumer`]; everything else in this crate
//! is a stage it composes.

use thiserror::Error;

use weir_core::{Retriable, StoreError};
use weir_counters::CounterStoreError;

pub mod config;
pub mod consumer;
pub mod grouper;
pub mod metrics;
pub mod preprocess;
pub mod producer;
pub mod restrictions;
pub mod router;
pub mod stores;
pub mod transformer;

pub use config::ConsumerConfig;
pub use consumer::{BatchResult, IngestionConsumer, IngestionDeps};
pub use grouper::group_events_by_key;
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use preprocess::{InMemoryTeamResolver, Preprocessor, TeamResolver};
pub use producer::{InMemoryProducer, InjectedFailure, MessageProducer, ProduceError};
pub use restrictions::EventRestrictionManager;
pub use router::OverflowRouter;
pub use stores::{
    BatchStore, BufferedBatchStore, DeduplicationStore, InMemoryDeduplicationStore,
    InMemoryWarningSink, IngestionWarning, IngestionWarningSink,
};
pub use transformer::{
    TransformError, TransformFunction, TransformOutcome, TransformerService,
};

/// Pipeline processing errors.
///
/// The retriable/non-retriable split drives the per-event retry loop and
/// the dead-letter decision: transient dependency failures are retried and
/// eventually fail the whole batch (so the log redelivers it), while
/// event-scoped failures dead-letter just that event.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A dependency hiccup that a retry may resolve
    #[error("transient failure: {0}")]
    Transient(String),

    /// A failure tied to the event itself; retrying cannot help
    #[error("event failure: {0}")]
    Event(String),
}

impl Retriable for PipelineError {
    fn is_retriable(&self) -> bool {
        matches!(self, PipelineError::Transient(_))
    }
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        PipelineError::Transient(e.to_string())
    }
}

impl From<CounterStoreError> for PipelineError {
    fn from(e: CounterStoreError) -> Self {
        PipelineError::Transient(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retriable() {
        assert!(PipelineError::Transient("redis timeout".to_string()).is_retriable());
        assert!(!PipelineError::Event("bad uuid".to_string()).is_retriable());
    }

    #[test]
    fn test_store_errors_map_to_transient() {
        let e: PipelineError = StoreError::Unavailable("down".to_string()).into();
        assert!(e.is_retriable());
    }
}
