//! In-memory outbox store.
//!
//! A single mutex guards the whole map, which makes `claim` trivially
//! atomic. Arrival order breaks ties between entries with equal priority
//! and creation time, mirroring rowid order in the SQLite store.

use crate::entry::{ClaimOutcome, OutboxEntry, OutboxStatus};
use crate::error::{OutboxError, OutboxResult};
use crate::store::{OutboxStore, StatusCounts};
use chrono::{DateTime, Utc};
use courier_core::MessageId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct Inner {
    /// message_id -> (arrival number, entry).
    entries: HashMap<String, (u64, OutboxEntry)>,
    /// stream_name -> last assigned sequence.
    sequences: HashMap<String, i64>,
    next_arrival: u64,
}

/// In-memory [`OutboxStore`].
#[derive(Default)]
pub struct MemoryOutboxStore {
    inner: Mutex<Inner>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn collect_where<F>(&self, pred: F, limit: Option<usize>) -> Vec<OutboxEntry>
    where
        F: Fn(&OutboxEntry) -> bool,
    {
        let inner = self.lock();
        let mut matched: Vec<(u64, OutboxEntry)> = inner
            .entries
            .values()
            .filter(|(_, entry)| pred(entry))
            .cloned()
            .collect();
        drop(inner);

        matched.sort_by(|(arrival_a, a), (arrival_b, b)| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| arrival_a.cmp(arrival_b))
        });
        let mut entries: Vec<OutboxEntry> = matched.into_iter().map(|(_, entry)| entry).collect();
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        entries
    }
}

fn lease_expired(entry: &OutboxEntry) -> bool {
    entry.status == OutboxStatus::Processing
        && entry.locked_until.map_or(true, |until| until <= Utc::now())
}

impl OutboxStore for MemoryOutboxStore {
    fn add(&self, mut entry: OutboxEntry) -> OutboxResult<OutboxEntry> {
        let mut inner = self.lock();
        let key = entry.message_id.as_str().to_string();
        if inner.entries.contains_key(&key) {
            return Err(OutboxError::Duplicate(key));
        }

        let sequence = inner
            .sequences
            .entry(entry.stream_name.clone())
            .and_modify(|seq| *seq += 1)
            .or_insert(1);
        entry.sequence_number = Some(*sequence);

        let arrival = inner.next_arrival;
        inner.next_arrival += 1;
        inner.entries.insert(key, (arrival, entry.clone()));
        Ok(entry)
    }

    fn get(&self, id: &MessageId) -> OutboxResult<Option<OutboxEntry>> {
        let inner = self.lock();
        Ok(inner.entries.get(id.as_str()).map(|(_, entry)| entry.clone()))
    }

    fn update(&self, entry: &OutboxEntry) -> OutboxResult<()> {
        let mut inner = self.lock();
        match inner.entries.get_mut(entry.message_id.as_str()) {
            Some((_, stored)) => {
                *stored = entry.clone();
                Ok(())
            }
            None => Err(OutboxError::NotFound(
                entry.message_id.as_str().to_string(),
            )),
        }
    }

    fn claim(
        &self,
        id: &MessageId,
        worker_id: &str,
        lease: Duration,
    ) -> OutboxResult<ClaimOutcome> {
        let mut inner = self.lock();
        match inner.entries.get_mut(id.as_str()) {
            Some((_, entry)) => Ok(entry.start_processing(worker_id, lease)),
            None => Err(OutboxError::NotFound(id.as_str().to_string())),
        }
    }

    fn find_ready(&self, limit: usize) -> OutboxResult<Vec<OutboxEntry>> {
        Ok(self.collect_where(
            |entry| entry.is_ready_for_processing() || lease_expired(entry),
            Some(limit),
        ))
    }

    fn find_unprocessed(&self, limit: Option<usize>) -> OutboxResult<Vec<OutboxEntry>> {
        Ok(self.collect_where(|entry| entry.status == OutboxStatus::Pending, limit))
    }

    fn find_failed(&self, limit: Option<usize>) -> OutboxResult<Vec<OutboxEntry>> {
        Ok(self.collect_where(|entry| entry.status == OutboxStatus::Failed, limit))
    }

    fn find_stale_processing(&self, limit: Option<usize>) -> OutboxResult<Vec<OutboxEntry>> {
        Ok(self.collect_where(lease_expired, limit))
    }

    fn find_retry_ready(&self, limit: Option<usize>) -> OutboxResult<Vec<OutboxEntry>> {
        Ok(self.collect_where(
            |entry| {
                entry.status == OutboxStatus::Failed
                    && entry.retry_count < entry.max_retries
                    && entry.next_retry_at.map_or(true, |due| due <= Utc::now())
            },
            limit,
        ))
    }

    fn count_by_status(&self) -> OutboxResult<StatusCounts> {
        let inner = self.lock();
        let mut counts = StatusCounts::default();
        for (_, entry) in inner.entries.values() {
            match entry.status {
                OutboxStatus::Pending => counts.pending += 1,
                OutboxStatus::Processing => counts.processing += 1,
                OutboxStatus::Published => counts.published += 1,
                OutboxStatus::Failed => counts.failed += 1,
                OutboxStatus::Abandoned => counts.abandoned += 1,
            }
        }
        Ok(counts)
    }

    fn cleanup_published(&self, older_than: Duration) -> OutboxResult<usize> {
        // An age past the calendar range clamps to "keep everything"
        // instead of overflowing the subtraction.
        let delta = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(delta)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, (_, entry)| {
            !(entry.status == OutboxStatus::Published
                && entry.published_at.map_or(false, |at| at <= cutoff))
        });
        Ok(before - inner.entries.len())
    }
}
