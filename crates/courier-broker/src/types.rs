//! Shared broker types.

use chrono::{DateTime, Utc};
use courier_core::MessagePayload;
use serde::{Deserialize, Serialize};

/// A message delivered from a stream.
///
/// The `id` is the broker-assigned identifier: a composite
/// `"<ms-timestamp>-<sequence>"` entry id for the Redis broker, an opaque
/// UUID for the in-process broker. Callers must not parse it.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: String,
    pub payload: MessagePayload,
}

/// A message quarantined after exhausting its retry budget.
///
/// Write-once, read-many: dead letters are never redelivered.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub payload: MessagePayload,
    pub original_id: String,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Where delivery starts when a (stream, group) pair is first created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStart {
    /// New messages only, no historical replay.
    #[default]
    Tail,
    /// Replay the retained backlog from the start of the stream.
    Beginning,
}

/// Per-group diagnostics for one stream. Observability only.
#[derive(Debug, Clone, Serialize)]
pub struct GroupInfo {
    pub name: String,
    pub consumers: Vec<String>,
    pub pending: u64,
    pub last_delivered_id: Option<String>,
}

/// Per-stream diagnostics. Observability only, never used for
/// correctness decisions.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub stream: String,
    pub length: u64,
    pub groups: Vec<GroupInfo>,
}

/// Broker-level health diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStats {
    pub kind: String,
    pub healthy: bool,
    pub capabilities: Vec<&'static str>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_start_serde_forms() {
        assert_eq!(serde_json::to_string(&DeliveryStart::Tail).unwrap(), "\"tail\"");
        assert_eq!(
            serde_json::to_string(&DeliveryStart::Beginning).unwrap(),
            "\"beginning\""
        );

        let parsed: DeliveryStart = serde_json::from_str("\"beginning\"").unwrap();
        assert_eq!(parsed, DeliveryStart::Beginning);
    }

    #[test]
    fn delivery_start_defaults_to_tail() {
        assert_eq!(DeliveryStart::default(), DeliveryStart::Tail);
    }
}
