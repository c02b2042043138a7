//! Store seams used by the consumer.
//!
//! Dedup recording, ingestion warnings, and the batched person/group state
//! stores. Real deployments back these with shared infrastructure; the
//! in-memory doubles here serve tests and single-node runs.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use weir_event::{OutboundMessage, TeamId};

use crate::PipelineError;

/// Best-effort duplicate tracking.
///
/// Recording runs off the critical path; its failure never fails a batch.
#[async_trait]
pub trait DeduplicationStore: Send + Sync {
    /// Record the keys of a batch. Returns how many were already seen.
    async fn record_batch(&self, keys: Vec<String>) -> Result<u64, PipelineError>;
}

/// In-process dedup store
#[derive(Debug, Default)]
pub struct InMemoryDeduplicationStore {
    seen: DashMap<String, u64>,
}

impl InMemoryDeduplicationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times a key has been recorded
    pub fn occurrences(&self, key: &str) -> u64 {
        self.seen.get(key).map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl DeduplicationStore for InMemoryDeduplicationStore {
    async fn record_batch(&self, keys: Vec<String>) -> Result<u64, PipelineError> {
        let mut duplicates = 0;
        for key in keys {
            let mut count = self.seen.entry(key).or_insert(0);
            if *count > 0 {
                duplicates += 1;
            }
            *count += 1;
        }
        Ok(duplicates)
    }
}

/// A warning surfaced to the tenant about a malformed or rejected event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionWarning {
    /// Tenant the warning belongs to; 0 when the tenant is unknown
    pub team_id: TeamId,

    /// Machine-readable warning type, e.g. `invalid_event_uuid`
    pub warning_type: String,

    /// Serialized details shown to the tenant
    pub details: String,
}

/// Sink for tenant-visible ingestion warnings
pub trait IngestionWarningSink: Send + Sync {
    fn emit(&self, warning: IngestionWarning);
}

/// Collects warnings for inspection in tests
#[derive(Debug, Default)]
pub struct InMemoryWarningSink {
    warnings: Mutex<Vec<IngestionWarning>>,
}

impl InMemoryWarningSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warnings(&self) -> Vec<IngestionWarning> {
        self.warnings.lock().clone()
    }
}

impl IngestionWarningSink for InMemoryWarningSink {
    fn emit(&self, warning: IngestionWarning) {
        self.warnings.lock().push(warning);
    }
}

/// Batched keyed state store for person and group records.
///
/// Upserts accumulate in a buffer; `flush` drains it once per batch and
/// returns the change messages the consumer must produce before the batch
/// is acknowledged.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Merge properties into the record for `(team_id, key)`
    async fn upsert(
        &self,
        team_id: TeamId,
        key: &str,
        properties: Value,
    ) -> Result<(), PipelineError>;

    /// Drain buffered writes, returning one change message per record
    async fn flush(&self) -> Result<Vec<OutboundMessage>, PipelineError>;
}

/// Buffering store that emits change messages to a fixed topic on flush
#[derive(Debug)]
pub struct BufferedBatchStore {
    topic: String,
    buffer: Mutex<Vec<(TeamId, String, Value)>>,
}

impl BufferedBatchStore {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            buffer: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl BatchStore for BufferedBatchStore {
    async fn upsert(
        &self,
        team_id: TeamId,
        key: &str,
        properties: Value,
    ) -> Result<(), PipelineError> {
        self.buffer.lock().push((team_id, key.to_string(), properties));
        Ok(())
    }

    async fn flush(&self) -> Result<Vec<OutboundMessage>, PipelineError> {
        let drained = std::mem::take(&mut *self.buffer.lock());

        // Merge repeated upserts of the same record, preserving first-seen
        // order so the change stream stays deterministic.
        let mut order: Vec<(TeamId, String)> = Vec::new();
        let mut merged: ahash::AHashMap<(TeamId, String), Value> = ahash::AHashMap::new();
        for (team_id, key, properties) in drained {
            let record = (team_id, key);
            match merged.get_mut(&record) {
                Some(existing) => merge_properties(existing, properties),
                None => {
                    merged.insert(record.clone(), properties);
                    order.push(record);
                }
            }
        }

        let mut messages = Vec::with_capacity(order.len());
        for record in order {
            let properties = merged
                .remove(&record)
                .unwrap_or(Value::Object(Default::default()));
            let (team_id, key) = record;
            let payload = serde_json::json!({
                "team_id": team_id,
                "key": key,
                "properties": properties,
            });
            messages.push(OutboundMessage {
                topic: self.topic.clone(),
                key: Some(format!("{team_id}:{key}").into_bytes()),
                value: payload.to_string().into_bytes(),
                headers: vec![],
            });
        }
        Ok(messages)
    }
}

/// Shallow merge of `incoming` object keys over `existing`; later writes win
fn merge_properties(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Object(base), Value::Object(update)) => {
            for (k, v) in update {
                base.insert(k, v);
            }
        }
        (existing, incoming) => *existing = incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_dedup_counts_repeats() {
        let store = InMemoryDeduplicationStore::new();

        let dupes = store
            .record_batch(vec!["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(dupes, 0);

        let dupes = store
            .record_batch(vec!["a".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(dupes, 1);
        assert_eq!(store.occurrences("a"), 2);
    }

    #[tokio::test]
    async fn test_flush_drains_buffer() {
        let store = BufferedBatchStore::new("person-updates");
        store.upsert(2, "user-1", json!({"name": "a"})).await.unwrap();

        let messages = store.flush().await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "person-updates");
        assert_eq!(messages[0].key.as_deref(), Some(b"2:user-1".as_slice()));

        assert!(store.flush().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_flush_merges_repeated_upserts() {
        let store = BufferedBatchStore::new("person-updates");
        store
            .upsert(2, "user-1", json!({"name": "a", "plan": "free"}))
            .await
            .unwrap();
        store.upsert(2, "user-1", json!({"plan": "paid"})).await.unwrap();
        store.upsert(3, "user-1", json!({"name": "b"})).await.unwrap();

        let messages = store.flush().await.unwrap();
        assert_eq!(messages.len(), 2);

        let payload: Value = serde_json::from_slice(&messages[0].value).unwrap();
        assert_eq!(payload["properties"]["name"], "a");
        assert_eq!(payload["properties"]["plan"], "paid");
    }
}
