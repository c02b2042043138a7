//! Weir Event Model
//!
//! This module defines the message and event structures used throughout the
//! Weir ingestion pipeline: raw log messages as read from the durable log,
//! parsed pipeline events, resolved tenants, and outbound messages.

use serde_json::Value;
use smallvec::SmallVec;

pub mod breadcrumb;

pub use breadcrumb::{Breadcrumb, BREADCRUMB_HEADER};

/// Numeric tenant identifier
pub type TeamId = i64;

/// A raw message as read from the durable ordered log.
///
/// Immutable once read; its lifecycle is bounded by one batch invocation.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Topic the message was read from
    pub topic: String,

    /// Partition within the topic
    pub partition: i32,

    /// Offset within the partition
    pub offset: i64,

    /// Broker-assigned timestamp (milliseconds since epoch)
    pub timestamp_ms: u64,

    /// Partition routing key, if any
    pub key: Option<Vec<u8>>,

    /// Opaque payload
    pub value: Vec<u8>,

    /// Header records (name, raw value)
    pub headers: SmallVec<[(String, Vec<u8>); 4]>,
}

impl RawMessage {
    /// Get the raw value of the first header with the given name
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }
}

/// A message to be produced to an outbound destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Destination topic
    pub topic: String,

    /// Partition routing key (`None` means random partitioning)
    pub key: Option<Vec<u8>>,

    /// Payload
    pub value: Vec<u8>,

    /// Header records
    pub headers: Vec<(String, Vec<u8>)>,
}

/// A parsed client-submitted event
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PipelineEvent {
    /// Unique event id. Client-supplied, so validated downstream rather
    /// than at parse time.
    #[serde(default)]
    pub uuid: String,

    /// Event name (e.g. `$pageview`)
    pub event: String,

    /// Tenant API token
    #[serde(default)]
    pub token: Option<String>,

    /// Identity the event belongs to
    #[serde(default)]
    pub distinct_id: Option<String>,

    /// Client-provided timestamp, if any
    #[serde(default)]
    pub timestamp: Option<String>,

    /// Arbitrary event properties
    #[serde(default)]
    pub properties: Value,
}

impl PipelineEvent {
    /// Parse an event from a raw payload
    pub fn parse(value: &[u8]) -> Result<Self, ParseError> {
        serde_json::from_slice(value).map_err(ParseError::InvalidPayload)
    }
}

/// A resolved tenant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Team {
    /// Numeric tenant id
    pub id: TeamId,

    /// API token
    pub token: String,

    /// Display name
    pub name: String,
}

/// A parsed event together with its raw message and resolved tenant
#[derive(Debug, Clone)]
pub struct EventWithTeam {
    /// The original raw message, kept for redirection and dead-lettering
    pub message: RawMessage,

    /// The parsed event
    pub event: PipelineEvent,

    /// The resolved tenant
    pub team: Team,

    /// Whether person-state processing is disabled for this identity
    pub skip_person: bool,
}

/// Events for a single `(token, distinct_id)` key, in arrival order
#[derive(Debug, Clone)]
pub struct EventsForKey {
    /// Tenant API token shared by every event in the group
    pub token: String,

    /// Identity shared by every event in the group
    pub distinct_id: String,

    /// Events in arrival order
    pub events: Vec<EventWithTeam>,
}

impl EventsForKey {
    /// The composite key string used for rate limiting and logging
    pub fn key(&self) -> String {
        format!("{}:{}", self.token, self.distinct_id)
    }
}

/// Error parsing a raw payload into an event
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid event payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),
}
