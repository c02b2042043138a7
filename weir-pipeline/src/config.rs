//! Consumer configuration.

use serde::{Deserialize, Serialize};

use weir_core::WatcherConfig;

/// Configuration for one ingestion consumer instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Consumer group id, recorded in breadcrumbs
    pub group_id: String,

    /// Topic this consumer reads from
    pub input_topic: String,

    /// Overflow destination; `None` disables overflow routing entirely
    pub overflow_topic: Option<String>,

    /// Dead letter destination for events that fail non-retriably
    pub dlq_topic: String,

    /// When set, every event is redirected here and nothing is processed
    /// locally. Used to mirror production traffic into test stacks.
    pub testing_topic: Option<String>,

    /// Token bucket capacity per `token:distinct_id` key
    pub overflow_bucket_capacity: f64,

    /// Token bucket refill rate per second
    pub overflow_refill_per_sec: f64,

    /// Keys (`token` or `token:distinct_id`) whose events are dropped
    pub drop_events: Vec<String>,

    /// Keys whose events skip person-state processing
    pub skip_person: Vec<String>,

    /// Keys whose events always route to overflow
    pub force_overflow: Vec<String>,

    /// Whether forced-overflow events keep their partition key
    pub preserve_partition_locality: bool,

    /// Fraction of batches that refresh the cached function health states
    pub watcher_sample_rate: f64,

    /// Log the first offset of each partition at batch start
    pub batch_start_logging: bool,

    /// Whether behavioral counters are persisted
    pub counters_enabled: bool,

    /// Function health watcher settings
    pub watcher: WatcherConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: "events-ingestion".to_string(),
            input_topic: "events-main".to_string(),
            overflow_topic: Some("events-overflow".to_string()),
            dlq_topic: "events-dlq".to_string(),
            testing_topic: None,
            overflow_bucket_capacity: 1000.0,
            overflow_refill_per_sec: 1.0,
            drop_events: Vec::new(),
            skip_person: Vec::new(),
            force_overflow: Vec::new(),
            preserve_partition_locality: false,
            watcher_sample_rate: 0.1,
            batch_start_logging: false,
            counters_enabled: true,
            watcher: WatcherConfig::default(),
        }
    }
}
