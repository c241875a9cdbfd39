//! Outbox entry state machine.
//!
//! One entry is one staged outgoing message. Entries are created PENDING in
//! the same transaction as the business state they describe and only ever
//! move through the named transition methods:
//!
//! ```text
//! PENDING ----> PROCESSING ----> PUBLISHED            (terminal)
//!                   |       \--> FAILED --> PROCESSING  (retry due)
//!                   |                  \--> PENDING     (manual reset)
//!                   |                  \--> ABANDONED
//!                   \-----------------------^   ABANDONED --> PENDING
//!                                                (manual reset only)
//! ```
//!
//! The lease fields (`locked_by`, `locked_until`) are the only
//! mutual-exclusion primitive between workers: a time-boxed claim, not a
//! distributed lock. An expired lease means the owning worker crashed and
//! the entry is reclaimable.

use chrono::{DateTime, Utc};
use courier_core::{retry_delay, MessageId, MessageMetadata, MessagePayload};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default retry ceiling for staged entries.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lifecycle states of a staged entry. Persisted as uppercase strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    #[default]
    Pending,
    Processing,
    Published,
    Failed,
    Abandoned,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
            OutboxStatus::Abandoned => "ABANDONED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OutboxStatus::Pending),
            "PROCESSING" => Some(OutboxStatus::Processing),
            "PUBLISHED" => Some(OutboxStatus::Published),
            "FAILED" => Some(OutboxStatus::Failed),
            "ABANDONED" => Some(OutboxStatus::Abandoned),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a claim attempt. Only `Success` mutates the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The entry is now PROCESSING under the caller's lease.
    Success,
    /// Terminal or otherwise unclaimable state (PUBLISHED, ABANDONED).
    NotEligible,
    /// Another worker holds an unexpired lease.
    AlreadyLocked,
    /// FAILED with the retry budget spent.
    MaxRetriesExceeded,
    /// FAILED with `next_retry_at` still in the future.
    RetryNotDue,
}

/// One staged outgoing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub message_id: MessageId,
    /// Target stream category. Empty means the entry was staged without one;
    /// the processor publishes it with an empty stream name and logs.
    pub stream_name: String,
    pub message_type: String,
    pub data: serde_json::Value,
    pub metadata: MessageMetadata,
    /// Signed routing priority, default 0. Higher publishes first.
    pub priority: i32,
    pub correlation_id: Option<String>,
    pub trace_id: Option<String>,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Lease holder; set only while PROCESSING, together with `locked_until`.
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    /// Earliest next attempt; set only while FAILED.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Per-stream dense sequence, assigned by the store on `add`.
    pub sequence_number: Option<i64>,
}

impl OutboxEntry {
    /// Stage a new PENDING entry.
    pub fn new(
        stream_name: impl Into<String>,
        message_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            message_id: MessageId::new(),
            stream_name: stream_name.into(),
            message_type: message_type.into(),
            data,
            metadata: MessageMetadata::new("event"),
            priority: 0,
            correlation_id: None,
            trace_id: None,
            status: OutboxStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: Utc::now(),
            published_at: None,
            last_processed_at: None,
            last_error: None,
            locked_by: None,
            locked_until: None,
            next_retry_at: None,
            sequence_number: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Try to claim the entry for `worker_id` under a time-boxed lease.
    ///
    /// Claimable from PENDING, from FAILED once `next_retry_at` has passed
    /// while under the retry ceiling, and from PROCESSING whose lease has
    /// expired (the owning worker crashed). Every other case answers
    /// without mutating the entry.
    pub fn start_processing(&mut self, worker_id: &str, lease: Duration) -> ClaimOutcome {
        let now = Utc::now();
        match self.status {
            OutboxStatus::Pending => {}
            OutboxStatus::Failed => {
                if self.retry_count >= self.max_retries {
                    return ClaimOutcome::MaxRetriesExceeded;
                }
                if let Some(due) = self.next_retry_at {
                    if due > now {
                        return ClaimOutcome::RetryNotDue;
                    }
                }
            }
            OutboxStatus::Processing => match self.locked_until {
                Some(until) if until > now => return ClaimOutcome::AlreadyLocked,
                // Expired or missing lease: crash reclaim.
                _ => {}
            },
            OutboxStatus::Published | OutboxStatus::Abandoned => {
                return ClaimOutcome::NotEligible;
            }
        }

        self.status = OutboxStatus::Processing;
        self.locked_by = Some(worker_id.to_string());
        self.locked_until = Some(now + to_chrono(lease));
        self.last_processed_at = Some(now);
        self.next_retry_at = None;
        ClaimOutcome::Success
    }

    /// PROCESSING -> PUBLISHED. Clears the lease and any stale error,
    /// stamps `published_at`. A no-op `false` from any other state.
    pub fn mark_published(&mut self) -> bool {
        if self.status != OutboxStatus::Processing {
            return false;
        }
        self.status = OutboxStatus::Published;
        self.published_at = Some(Utc::now());
        self.locked_by = None;
        self.locked_until = None;
        self.last_error = None;
        true
    }

    /// PROCESSING -> FAILED, or -> ABANDONED once the incremented counter
    /// meets `max_retries`. Always releases the lease and records the
    /// error; FAILED entries get `next_retry_at = now + base_delay *
    /// 2^retry_count`.
    pub fn mark_failed(&mut self, error: &str, base_delay: Duration) -> bool {
        if self.status != OutboxStatus::Processing {
            return false;
        }
        self.retry_count += 1;
        self.locked_by = None;
        self.locked_until = None;

        if self.retry_count >= self.max_retries {
            self.status = OutboxStatus::Abandoned;
            self.next_retry_at = None;
            self.last_error = Some(format!(
                "retries exhausted after {} attempts: {}",
                self.retry_count, error
            ));
        } else {
            self.status = OutboxStatus::Failed;
            self.next_retry_at = Some(Utc::now() + to_chrono(retry_delay(base_delay, self.retry_count)));
            self.last_error = Some(error.to_string());
        }
        true
    }

    /// Explicit terminal failure, independent of the retry counter (which is
    /// preserved for audit). Allowed from PENDING, PROCESSING and FAILED.
    pub fn mark_abandoned(&mut self, reason: &str) -> bool {
        match self.status {
            OutboxStatus::Pending | OutboxStatus::Processing | OutboxStatus::Failed => {
                self.status = OutboxStatus::Abandoned;
                self.last_error = Some(reason.to_string());
                self.locked_by = None;
                self.locked_until = None;
                self.next_retry_at = None;
                true
            }
            OutboxStatus::Published | OutboxStatus::Abandoned => false,
        }
    }

    /// Manual requeue: FAILED or ABANDONED -> PENDING. Clears the schedule
    /// and lease but keeps `retry_count` and `last_error` for audit.
    pub fn reset_for_retry(&mut self) -> bool {
        match self.status {
            OutboxStatus::Failed | OutboxStatus::Abandoned => {
                self.status = OutboxStatus::Pending;
                self.next_retry_at = None;
                self.locked_by = None;
                self.locked_until = None;
                true
            }
            _ => false,
        }
    }

    /// Whether a worker could claim this entry right now.
    pub fn is_ready_for_processing(&self) -> bool {
        match self.status {
            OutboxStatus::Pending => true,
            OutboxStatus::Failed => {
                self.locked_by.is_none()
                    && self.retry_count < self.max_retries
                    && self.next_retry_at.map_or(true, |due| due <= Utc::now())
            }
            _ => false,
        }
    }

    /// Re-prioritize a waiting entry. Ignored once processing has begun.
    pub fn update_priority(&mut self, priority: i32) -> bool {
        match self.status {
            OutboxStatus::Pending | OutboxStatus::Failed => {
                self.priority = priority;
                true
            }
            _ => false,
        }
    }

    /// Build the outgoing wire envelope. Injects the stream category and
    /// store-assigned sequence number into the metadata when absent.
    pub fn wire_payload(&self) -> MessagePayload {
        let mut metadata = self.metadata.clone();
        if metadata.stream_category.is_none() && !self.stream_name.is_empty() {
            metadata.stream_category = Some(self.stream_name.clone());
        }
        if metadata.sequence_number.is_none() {
            metadata.sequence_number = self.sequence_number;
        }
        MessagePayload {
            id: self.message_id.as_str().to_string(),
            message_type: self.message_type.clone(),
            data: self.data.clone(),
            metadata,
            correlation_id: self.correlation_id.clone(),
            trace_id: self.trace_id.clone(),
            created_at: self.created_at,
        }
    }
}

// Offsets cap at a millennium: the DateTime additions above must stay
// inside the calendar, and stored timestamps keep four-digit years.
fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or(chrono::Duration::MAX)
        .min(chrono::Duration::days(365 * 1_000))
}
