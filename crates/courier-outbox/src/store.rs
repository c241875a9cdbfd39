//! Outbox store contract.
//!
//! The processor only ever talks to `dyn OutboxStore`; storage technology is
//! interchangeable. Implementations guarantee that `claim` is atomic (under
//! their internal lock or transaction) and that `add` assigns the per-stream
//! sequence number.

use crate::entry::{ClaimOutcome, OutboxEntry};
use crate::error::OutboxResult;
use courier_core::MessageId;
use std::sync::Arc;
use std::time::Duration;

/// Entry counts per status, for operator dashboards and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub published: usize,
    pub failed: usize,
    pub abandoned: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.published + self.failed + self.abandoned
    }
}

/// Durable staging area for outgoing messages.
///
/// Finder ordering is priority descending, then creation time ascending,
/// then arrival order; `limit = None` means unbounded.
pub trait OutboxStore: Send + Sync {
    /// Stage an entry, assigning its per-stream sequence number (dense,
    /// monotonic from 1). Staging the same `message_id` twice is a
    /// `Duplicate` error.
    fn add(&self, entry: OutboxEntry) -> OutboxResult<OutboxEntry>;

    fn get(&self, id: &MessageId) -> OutboxResult<Option<OutboxEntry>>;

    /// Persist the entry's current state. `NotFound` when it was never
    /// staged.
    fn update(&self, entry: &OutboxEntry) -> OutboxResult<()>;

    /// Atomically claim an entry for a worker: the entry's
    /// `start_processing` applied under the store's lock or transaction.
    /// Exactly one of two racing workers wins.
    fn claim(&self, id: &MessageId, worker_id: &str, lease: Duration)
        -> OutboxResult<ClaimOutcome>;

    /// Entries a worker could claim right now: PENDING, retry-due FAILED,
    /// and PROCESSING whose lease has expired.
    fn find_ready(&self, limit: usize) -> OutboxResult<Vec<OutboxEntry>>;

    /// PENDING entries.
    fn find_unprocessed(&self, limit: Option<usize>) -> OutboxResult<Vec<OutboxEntry>>;

    /// FAILED entries, whether or not their retry is due.
    fn find_failed(&self, limit: Option<usize>) -> OutboxResult<Vec<OutboxEntry>>;

    /// PROCESSING entries whose lease has expired (abandoned by a crashed
    /// worker).
    fn find_stale_processing(&self, limit: Option<usize>) -> OutboxResult<Vec<OutboxEntry>>;

    /// FAILED entries whose `next_retry_at` has passed and whose retry
    /// budget is not spent.
    fn find_retry_ready(&self, limit: Option<usize>) -> OutboxResult<Vec<OutboxEntry>>;

    fn count_by_status(&self) -> OutboxResult<StatusCounts>;

    /// Remove PUBLISHED entries older than the retention window. Returns
    /// how many were removed.
    fn cleanup_published(&self, older_than: Duration) -> OutboxResult<usize>;
}

/// Shared handle the processor and embedders hold.
pub type StoreHandle = Arc<dyn OutboxStore>;
