//! Wire payload envelope published to brokers.
//!
//! Every message that leaves the outbox is wrapped in a [`MessagePayload`].
//! The `metadata` envelope carries the message kind, the originating stream
//! category, and the per-stream sequence number consumers use for optimistic
//! concurrency. Extra metadata fields round-trip through `extra`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata envelope carried inside every wire payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Kind of message (command, event, notice, ...).
    pub kind: String,

    /// Stream category the message originated from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_category: Option<String>,

    /// Monotonically increasing per-stream sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<i64>,

    /// Any additional metadata fields, flattened into the envelope.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MessageMetadata {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            stream_category: None,
            sequence_number: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_stream_category(mut self, category: impl Into<String>) -> Self {
        self.stream_category = Some(category.into());
        self
    }

    pub fn with_sequence_number(mut self, sequence: i64) -> Self {
        self.sequence_number = Some(sequence);
        self
    }
}

/// The outgoing wire format: `{id, type, data, metadata, correlation_id,
/// trace_id, created_at}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Message identifier, stable across retries.
    pub id: String,

    /// Message type name.
    #[serde(rename = "type")]
    pub message_type: String,

    /// Domain payload.
    pub data: serde_json::Value,

    /// Metadata envelope.
    pub metadata: MessageMetadata,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    /// When the message was staged.
    pub created_at: DateTime<Utc>,
}
