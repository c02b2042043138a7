//! Per-hop provenance records attached to message headers.
//!
//! Every consumer hop appends a breadcrumb describing where it read the
//! message, then re-attaches the full list to any message it redirects or
//! produces. This makes reprocessing across overflow/testing redirections
//! traceable after the fact.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::RawMessage;

/// Header key carrying the breadcrumb list
pub const BREADCRUMB_HEADER: &str = "consumer-breadcrumbs";

/// A single provenance record for one consumer hop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breadcrumb {
    /// Topic the message was consumed from
    pub topic: String,

    /// Partition the message was consumed from
    pub partition: i32,

    /// Offset the message was consumed at
    pub offset: i64,

    /// When this hop processed the message (RFC 3339)
    pub processed_at: String,

    /// Consumer group id of this hop
    pub consumer_id: String,
}

impl Breadcrumb {
    /// Read existing breadcrumbs from a message's headers.
    ///
    /// Legacy producers wrote a single JSON object rather than an array;
    /// both encodings are accepted. Entries that fail validation are logged
    /// and skipped rather than failing the message.
    pub fn from_headers(message: &RawMessage) -> Vec<Breadcrumb> {
        let mut breadcrumbs = Vec::new();

        for (name, value) in &message.headers {
            if name != BREADCRUMB_HEADER {
                continue;
            }

            match serde_json::from_slice::<serde_json::Value>(value) {
                Ok(serde_json::Value::Array(items)) => {
                    for item in items {
                        match serde_json::from_value::<Breadcrumb>(item) {
                            Ok(b) => breadcrumbs.push(b),
                            Err(e) => {
                                warn!(error = %e, "Failed to validate breadcrumb array entry from header")
                            }
                        }
                    }
                }
                Ok(single) => match serde_json::from_value::<Breadcrumb>(single) {
                    Ok(b) => breadcrumbs.push(b),
                    Err(e) => warn!(error = %e, "Failed to validate breadcrumb from header"),
                },
                Err(e) => warn!(error = %e, "Failed to parse breadcrumb header"),
            }
        }

        breadcrumbs
    }

    /// Serialize a breadcrumb list into a header value
    pub fn to_header_value(breadcrumbs: &[Breadcrumb]) -> Vec<u8> {
        // A list of plain structs; serialization cannot fail.
        serde_json::to_vec(breadcrumbs).unwrap_or_default()
    }

    /// Replace or attach the breadcrumb header on an outbound header list
    pub fn attach(headers: &mut Vec<(String, Vec<u8>)>, breadcrumbs: &[Breadcrumb]) {
        headers.retain(|(name, _)| name != BREADCRUMB_HEADER);
        headers.push((
            BREADCRUMB_HEADER.to_string(),
            Self::to_header_value(breadcrumbs),
        ));
    }
}
