//! Pipeline counters.
//!
//! Cheap atomics bumped on the hot path, snapshotted by tests and the
//! periodic stats logger. Also tracks the high-water offset seen per
//! partition, which is what consumer lag monitoring compares against.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Hot-path counters for one consumer instance
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Events fully processed
    pub events_ingested: AtomicU64,

    /// Events dropped by restriction policy or parse/validation failure
    pub events_dropped: AtomicU64,

    /// Events redirected to the overflow topic
    pub events_overflowed: AtomicU64,

    /// Subset of overflowed events that were force-listed
    pub events_force_overflowed: AtomicU64,

    /// Events redirected to the testing topic
    pub events_mirrored: AtomicU64,

    /// Events sent to the dead letter topic
    pub events_dead_lettered: AtomicU64,

    /// Ingestion warnings emitted (post-throttle)
    pub ingestion_warnings: AtomicU64,

    /// Batches completed
    pub batches_processed: AtomicU64,

    /// Highest offset and its broker timestamp seen per (topic, partition)
    high_water: DashMap<(String, i32), (i64, u64)>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub events_ingested: u64,
    pub events_dropped: u64,
    pub events_overflowed: u64,
    pub events_force_overflowed: u64,
    pub events_mirrored: u64,
    pub events_dead_lettered: u64,
    pub ingestion_warnings: u64,
    pub batches_processed: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the offset watermark of a processed message. Keeps the max;
    /// batches may be observed out of order across tasks.
    pub fn record_offset(&self, topic: &str, partition: i32, offset: i64, timestamp_ms: u64) {
        let mut entry = self
            .high_water
            .entry((topic.to_string(), partition))
            .or_insert((offset, timestamp_ms));
        if offset > entry.0 {
            *entry = (offset, timestamp_ms);
        }
    }

    /// Highest offset recorded for a partition, if any
    pub fn high_water(&self, topic: &str, partition: i32) -> Option<(i64, u64)> {
        self.high_water
            .get(&(topic.to_string(), partition))
            .map(|e| *e)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_ingested: self.events_ingested.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_overflowed: self.events_overflowed.load(Ordering::Relaxed),
            events_force_overflowed: self.events_force_overflowed.load(Ordering::Relaxed),
            events_mirrored: self.events_mirrored.load(Ordering::Relaxed),
            events_dead_lettered: self.events_dead_lettered.load(Ordering::Relaxed),
            ingestion_warnings: self.ingestion_warnings.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
        }
    }
}
