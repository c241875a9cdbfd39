//! In-process buffered broker.
//!
//! Streams live in one retained, append-only log each. A tokio mutex per
//! stream linearizes access to that stream's state; a [`Notify`] per stream
//! wakes blocking readers on publish. There is no global lock.
//!
//! Consumer-group delivery keeps an ownership record per claimed entry:
//! reads serve due nack redeliveries first, then reclaim records idle past
//! the claim timeout, then fresh entries from the group cursor. Without the
//! CONSUMER_GROUPS capability the broker degrades to a single shared cursor
//! and keeps no ownership records.

use crate::capabilities::Capabilities;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::types::{DeadLetter, Delivery, DeliveryStart, GroupInfo, HealthStats, StreamInfo};
use chrono::Utc;
use courier_core::{retry_delay, MessagePayload};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, warn};

/// One retained message in a stream's log.
struct StoredEntry {
    id: String,
    payload: MessagePayload,
}

/// Ownership record for a claimed, unacknowledged delivery.
///
/// Exists only while claimed; removed on ack, re-queued on nack,
/// reclaimable by any consumer once idle past the claim timeout.
struct InFlight {
    index: usize,
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

/// A nacked entry waiting out its backoff before redelivery.
struct Redelivery {
    index: usize,
    id: String,
    due_at: Instant,
    delivery_count: u32,
}

struct GroupState {
    /// Index of the next fresh entry to deliver.
    cursor: usize,
    pending: HashMap<String, InFlight>,
    /// Per-identifier nack counters.
    retries: HashMap<String, u32>,
    redeliveries: Vec<Redelivery>,
    /// Consumer names seen on this group, for diagnostics.
    consumers: HashSet<String>,
    last_delivered_id: Option<String>,
}

impl GroupState {
    fn starting_at(cursor: usize) -> Self {
        Self {
            cursor,
            pending: HashMap::new(),
            retries: HashMap::new(),
            redeliveries: Vec::new(),
            consumers: HashSet::new(),
            last_delivered_id: None,
        }
    }
}

#[derive(Default)]
struct StreamInner {
    entries: Vec<StoredEntry>,
    groups: HashMap<String, GroupState>,
    /// Cursor shared by every caller when CONSUMER_GROUPS is absent.
    shared_cursor: usize,
    dead_letters: Vec<DeadLetter>,
}

struct StreamState {
    inner: Mutex<StreamInner>,
    notify: Notify,
}

impl StreamState {
    fn new() -> Self {
        Self {
            inner: Mutex::new(StreamInner::default()),
            notify: Notify::new(),
        }
    }
}

/// In-process buffered broker.
pub struct MemoryBroker {
    capabilities: Capabilities,
    config: BrokerConfig,
    streams: RwLock<HashMap<String, Arc<StreamState>>>,
    closed: AtomicBool,
}

impl MemoryBroker {
    /// Create a broker with the full in-process capability set:
    /// consumer groups, ack/nack, and blocking reads.
    pub fn new(config: BrokerConfig) -> BrokerResult<Self> {
        Self::with_capabilities(
            config,
            Capabilities::CONSUMER_GROUPS | Capabilities::ACK_NACK | Capabilities::BLOCKING_READ,
        )
    }

    /// Create a broker with an explicit capability set.
    ///
    /// Degraded brokers are useful in tests and for callers that want
    /// single-consumer fan-out semantics. Claiming PERSISTENCE is a
    /// configuration error: this broker keeps everything in memory.
    pub fn with_capabilities(
        config: BrokerConfig,
        capabilities: Capabilities,
    ) -> BrokerResult<Self> {
        config.validate()?;
        if capabilities.supports(Capabilities::PERSISTENCE) {
            return Err(BrokerError::Config(
                "an in-process broker cannot provide persistence".to_string(),
            ));
        }
        Ok(Self {
            capabilities,
            config,
            streams: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn check_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    async fn stream_state(&self, stream: &str) -> Arc<StreamState> {
        {
            let streams = self.streams.read().await;
            if let Some(state) = streams.get(stream) {
                return state.clone();
            }
        }
        let mut streams = self.streams.write().await;
        streams
            .entry(stream.to_string())
            .or_insert_with(|| Arc::new(StreamState::new()))
            .clone()
    }

    async fn existing_stream(&self, stream: &str) -> Option<Arc<StreamState>> {
        self.streams.read().await.get(stream).cloned()
    }

    /// Append a message and return its identifier (an opaque UUID).
    pub async fn publish(&self, stream: &str, payload: &MessagePayload) -> BrokerResult<String> {
        self.check_open()?;
        let state = self.stream_state(stream).await;
        let id = uuid::Uuid::new_v4().to_string();
        {
            let mut inner = state.inner.lock().await;
            inner.entries.push(StoredEntry {
                id: id.clone(),
                payload: payload.clone(),
            });
        }
        state.notify.notify_waiters();
        debug!(stream = %stream, message_id = %id, "published message");
        Ok(id)
    }

    /// Read up to `count` messages for `group` as the configured consumer.
    pub async fn read(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        let consumer = self.config.consumer_name.clone();
        self.read_as(stream, group, &consumer, count).await
    }

    /// Read up to `count` messages for `group` as a named consumer.
    ///
    /// Serves due nack redeliveries first, then reclaims in-flight records
    /// idle past the claim timeout, then fresh entries from the group
    /// cursor. First use of a new (stream, group) pair creates the group at
    /// the position given by the `group_start` config.
    pub async fn read_as(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        self.check_open()?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let state = self.stream_state(stream).await;
        let mut inner = state.inner.lock().await;

        if !self.capabilities.supports(Capabilities::CONSUMER_GROUPS) {
            // Degraded single-consumer delivery: one shared cursor, no
            // ownership records, every group name sees the same cursor.
            let start = inner.shared_cursor;
            let end = (start + count).min(inner.entries.len());
            let batch: Vec<Delivery> = inner.entries[start..end]
                .iter()
                .map(|e| Delivery {
                    id: e.id.clone(),
                    payload: e.payload.clone(),
                })
                .collect();
            inner.shared_cursor = end;
            return Ok(batch);
        }

        let StreamInner {
            entries, groups, ..
        } = &mut *inner;

        let at_tail = entries.len();
        let group_start = self.config.group_start;
        let gs = groups.entry(group.to_string()).or_insert_with(|| {
            GroupState::starting_at(match group_start {
                DeliveryStart::Tail => at_tail,
                DeliveryStart::Beginning => 0,
            })
        });
        gs.consumers.insert(consumer.to_string());

        let now = Instant::now();
        let claim_timeout = self.config.claim_timeout();
        let mut batch: Vec<Delivery> = Vec::new();

        // Due nack redeliveries come first.
        let mut waiting = Vec::new();
        for redelivery in gs.redeliveries.drain(..) {
            if batch.len() < count && redelivery.due_at <= now {
                if let Some(entry) = entries.get(redelivery.index) {
                    gs.pending.insert(
                        redelivery.id.clone(),
                        InFlight {
                            index: redelivery.index,
                            consumer: consumer.to_string(),
                            delivered_at: now,
                            delivery_count: redelivery.delivery_count + 1,
                        },
                    );
                    batch.push(Delivery {
                        id: entry.id.clone(),
                        payload: entry.payload.clone(),
                    });
                }
            } else {
                waiting.push(redelivery);
            }
        }
        gs.redeliveries = waiting;

        // Reclaim in-flight records idle past the claim timeout.
        if batch.len() < count {
            let mut expired: Vec<(usize, String)> = gs
                .pending
                .iter()
                .filter(|(_, flight)| now.duration_since(flight.delivered_at) >= claim_timeout)
                .map(|(id, flight)| (flight.index, id.clone()))
                .collect();
            expired.sort();
            for (index, id) in expired {
                if batch.len() >= count {
                    break;
                }
                if let Some(flight) = gs.pending.get_mut(&id) {
                    flight.consumer = consumer.to_string();
                    flight.delivered_at = now;
                    flight.delivery_count += 1;
                }
                if let Some(entry) = entries.get(index) {
                    batch.push(Delivery {
                        id: entry.id.clone(),
                        payload: entry.payload.clone(),
                    });
                }
            }
        }

        // Fresh entries from the group cursor.
        while batch.len() < count && gs.cursor < entries.len() {
            let entry = &entries[gs.cursor];
            gs.pending.insert(
                entry.id.clone(),
                InFlight {
                    index: gs.cursor,
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            gs.last_delivered_id = Some(entry.id.clone());
            batch.push(Delivery {
                id: entry.id.clone(),
                payload: entry.payload.clone(),
            });
            gs.cursor += 1;
        }

        Ok(batch)
    }

    /// Entries currently claimed by `consumer`, oldest first.
    async fn pending_for(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        self.check_open()?;
        let Some(state) = self.existing_stream(stream).await else {
            return Ok(Vec::new());
        };
        let inner = state.inner.lock().await;
        let Some(gs) = inner.groups.get(group) else {
            return Ok(Vec::new());
        };
        let mut owned: Vec<usize> = gs
            .pending
            .values()
            .filter(|flight| flight.consumer == consumer)
            .map(|flight| flight.index)
            .collect();
        owned.sort_unstable();
        owned.truncate(count);
        Ok(owned
            .into_iter()
            .filter_map(|index| {
                inner.entries.get(index).map(|e| Delivery {
                    id: e.id.clone(),
                    payload: e.payload.clone(),
                })
            })
            .collect())
    }

    /// Blocking read: serves `consumer`'s already-pending entries first,
    /// otherwise waits up to `timeout` for new entries.
    pub async fn read_blocking(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        timeout: Duration,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        self.check_open()?;
        let pending = self.pending_for(stream, group, consumer, count).await?;
        if !pending.is_empty() {
            return Ok(pending);
        }

        let state = self.stream_state(stream).await;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register for wakeups before reading so a publish landing
            // between the read and the wait is not lost.
            let notified = state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.read_as(stream, group, consumer, count).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
            self.check_open()?;
        }
    }

    /// Remove the ownership record for `id` if `group` currently holds one.
    ///
    /// Returns `Ok(false)` for unknown, already-acked or already-nacked
    /// identifiers, and after close. Never raises.
    pub async fn ack(&self, stream: &str, id: &str, group: &str) -> BrokerResult<bool> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let Some(state) = self.existing_stream(stream).await else {
            return Ok(false);
        };
        let mut inner = state.inner.lock().await;
        let Some(gs) = inner.groups.get_mut(group) else {
            return Ok(false);
        };
        if gs.pending.remove(id).is_none() {
            return Ok(false);
        }
        gs.retries.remove(id);
        debug!(stream = %stream, message_id = %id, group = %group, "acknowledged");
        Ok(true)
    }

    /// Negative acknowledgment. Increments the per-(stream, group, id)
    /// retry counter; schedules redelivery after `base_delay * 2^count`
    /// while the counter is within `max_retries`, dead-letters the message
    /// once it is past it. Always releases the ownership record.
    pub async fn nack(&self, stream: &str, id: &str, group: &str) -> BrokerResult<bool> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let Some(state) = self.existing_stream(stream).await else {
            return Ok(false);
        };
        let mut inner = state.inner.lock().await;
        let StreamInner {
            entries,
            groups,
            dead_letters,
            ..
        } = &mut *inner;
        let Some(gs) = groups.get_mut(group) else {
            return Ok(false);
        };
        // Ownership is released before anything else so a fault later in
        // this path cannot strand the record.
        let Some(flight) = gs.pending.remove(id) else {
            return Ok(false);
        };

        let counter = gs.retries.entry(id.to_string()).or_insert(0);
        *counter += 1;
        let count = *counter;

        if count > self.config.max_retries {
            gs.retries.remove(id);
            if let Some(entry) = entries.get(flight.index) {
                dead_letters.push(DeadLetter {
                    payload: entry.payload.clone(),
                    original_id: id.to_string(),
                    reason: format!("retry budget exhausted after {} nacks", count),
                    dead_lettered_at: Utc::now(),
                });
            }
            warn!(
                stream = %stream,
                message_id = %id,
                group = %group,
                nacks = count,
                "message dead-lettered"
            );
        } else {
            let delay = retry_delay(self.config.base_delay(), count);
            gs.redeliveries.push(Redelivery {
                index: flight.index,
                id: id.to_string(),
                due_at: Instant::now() + delay,
                delivery_count: flight.delivery_count,
            });
            debug!(
                stream = %stream,
                message_id = %id,
                group = %group,
                nacks = count,
                delay_ms = delay.as_millis() as u64,
                "redelivery scheduled"
            );
        }
        Ok(true)
    }

    /// Positional read: entries strictly after `after`, in append order.
    ///
    /// `None` replays from the beginning of the retained log. An unknown
    /// identifier also replays from the beginning: duplicate delivery is
    /// preferred over loss under at-least-once semantics.
    pub async fn read_from(
        &self,
        stream: &str,
        after: Option<&str>,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        self.check_open()?;
        let Some(state) = self.existing_stream(stream).await else {
            return Ok(Vec::new());
        };
        let inner = state.inner.lock().await;
        let start = match after {
            None => 0,
            Some(id) => inner
                .entries
                .iter()
                .position(|e| e.id == id)
                .map(|i| i + 1)
                .unwrap_or(0),
        };
        Ok(inner
            .entries
            .iter()
            .skip(start)
            .take(count)
            .map(|e| Delivery {
                id: e.id.clone(),
                payload: e.payload.clone(),
            })
            .collect())
    }

    /// Blocking positional read.
    pub async fn read_from_blocking(
        &self,
        stream: &str,
        after: Option<&str>,
        timeout: Duration,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        self.check_open()?;
        let state = self.stream_state(stream).await;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.read_from(stream, after, count).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
            self.check_open()?;
        }
    }

    /// Quarantine a message explicitly (subscription poison path).
    pub async fn dead_letter(
        &self,
        stream: &str,
        payload: &MessagePayload,
        original_id: &str,
        reason: &str,
    ) -> BrokerResult<()> {
        self.check_open()?;
        let state = self.stream_state(stream).await;
        let mut inner = state.inner.lock().await;
        inner.dead_letters.push(DeadLetter {
            payload: payload.clone(),
            original_id: original_id.to_string(),
            reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
        });
        warn!(stream = %stream, original_id = %original_id, reason = %reason, "message dead-lettered");
        Ok(())
    }

    /// Read up to `count` dead letters for a stream, oldest first.
    pub async fn read_dead_letters(
        &self,
        stream: &str,
        count: usize,
    ) -> BrokerResult<Vec<DeadLetter>> {
        self.check_open()?;
        let Some(state) = self.existing_stream(stream).await else {
            return Ok(Vec::new());
        };
        let inner = state.inner.lock().await;
        Ok(inner.dead_letters.iter().take(count).cloned().collect())
    }

    /// Per-stream diagnostics. `None` for streams this broker has never
    /// seen. Observability only.
    pub async fn info(&self, stream: &str) -> BrokerResult<Option<StreamInfo>> {
        self.check_open()?;
        let Some(state) = self.existing_stream(stream).await else {
            return Ok(None);
        };
        let inner = state.inner.lock().await;
        let mut groups: Vec<GroupInfo> = inner
            .groups
            .iter()
            .map(|(name, gs)| {
                let mut consumers: Vec<String> = gs.consumers.iter().cloned().collect();
                consumers.sort();
                GroupInfo {
                    name: name.clone(),
                    consumers,
                    pending: gs.pending.len() as u64,
                    last_delivered_id: gs.last_delivered_id.clone(),
                }
            })
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Some(StreamInfo {
            stream: stream.to_string(),
            length: inner.entries.len() as u64,
            groups,
        }))
    }

    pub fn health_stats(&self) -> HealthStats {
        HealthStats {
            kind: "memory".to_string(),
            healthy: !self.closed.load(Ordering::SeqCst),
            capabilities: self.capabilities.names(),
        }
    }

    /// Mark the broker closed and wake every blocked reader.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let streams = self.streams.read().await;
        for state in streams.values() {
            state.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::MessageMetadata;
    use serde_json::json;

    fn payload(n: u32) -> MessagePayload {
        MessagePayload {
            id: format!("msg-{}", n),
            message_type: "TestEvent".to_string(),
            data: json!({ "n": n }),
            metadata: MessageMetadata::new("event"),
            correlation_id: None,
            trace_id: None,
            created_at: Utc::now(),
        }
    }

    fn broker() -> MemoryBroker {
        MemoryBroker::new(BrokerConfig::default()).unwrap()
    }

    fn broker_with(config: BrokerConfig) -> MemoryBroker {
        MemoryBroker::new(config).unwrap()
    }

    #[tokio::test]
    async fn reads_deliver_in_publish_order_without_duplicates() {
        let broker = broker();
        for n in 1..=3 {
            broker.publish("orders", &payload(n)).await.unwrap();
        }

        let first = broker.read("orders", "g", 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].payload.id, "msg-1");
        assert_eq!(first[1].payload.id, "msg-2");

        let second = broker.read("orders", "g", 2).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].payload.id, "msg-3");

        assert!(broker.read("orders", "g", 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_assigns_unique_opaque_ids() {
        let broker = broker();
        let a = broker.publish("s", &payload(1)).await.unwrap();
        let b = broker.publish("s", &payload(2)).await.unwrap();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }

    #[tokio::test]
    async fn new_group_starts_at_tail_by_default() {
        let broker = broker();
        broker.publish("orders", &payload(1)).await.unwrap();
        broker.publish("orders", &payload(2)).await.unwrap();

        // First read creates the group at the tail: backlog is invisible.
        assert!(broker.read("orders", "late", 10).await.unwrap().is_empty());

        broker.publish("orders", &payload(3)).await.unwrap();
        let batch = broker.read("orders", "late", 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload.id, "msg-3");
    }

    #[tokio::test]
    async fn group_start_beginning_replays_backlog() {
        let config = BrokerConfig {
            group_start: DeliveryStart::Beginning,
            ..BrokerConfig::default()
        };
        let broker = broker_with(config);
        broker.publish("orders", &payload(1)).await.unwrap();
        broker.publish("orders", &payload(2)).await.unwrap();

        let batch = broker.read("orders", "replayer", 10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload.id, "msg-1");
    }

    #[tokio::test]
    async fn groups_each_receive_every_message() {
        let config = BrokerConfig {
            group_start: DeliveryStart::Beginning,
            ..BrokerConfig::default()
        };
        let broker = broker_with(config);
        broker.publish("orders", &payload(1)).await.unwrap();
        broker.publish("orders", &payload(2)).await.unwrap();

        let a = broker.read("orders", "billing", 10).await.unwrap();
        let b = broker.read("orders", "shipping", 10).await.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
    }

    #[tokio::test]
    async fn consumers_in_one_group_compete() {
        let config = BrokerConfig {
            group_start: DeliveryStart::Beginning,
            ..BrokerConfig::default()
        };
        let broker = broker_with(config);
        for n in 1..=4 {
            broker.publish("orders", &payload(n)).await.unwrap();
        }

        let first = broker.read_as("orders", "g", "alice", 2).await.unwrap();
        let second = broker.read_as("orders", "g", "bob", 10).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].payload.id, "msg-3");
    }

    #[tokio::test]
    async fn concurrent_consumers_split_the_stream_without_overlap() {
        let config = BrokerConfig {
            group_start: DeliveryStart::Beginning,
            ..BrokerConfig::default()
        };
        let broker = broker_with(config);
        for n in 1..=20 {
            broker.publish("orders", &payload(n)).await.unwrap();
        }

        let broker = &broker;
        let drained = futures::future::join_all((0..4).map(|c| async move {
            let consumer = format!("worker-{}", c);
            let mut mine = Vec::new();
            loop {
                let batch = broker.read_as("orders", "g", &consumer, 3).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                mine.extend(batch);
            }
            mine
        }))
        .await;

        let mut ids: Vec<String> = drained
            .into_iter()
            .flatten()
            .map(|d| d.payload.id)
            .collect();
        assert_eq!(ids.len(), 20);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 20);
    }

    #[tokio::test]
    async fn ack_removes_the_ownership_record_once() {
        let broker = broker();
        broker.publish("orders", &payload(1)).await.unwrap();
        let batch = broker.read("orders", "g", 1).await.unwrap();
        let id = batch[0].id.clone();

        assert!(broker.ack("orders", &id, "g").await.unwrap());
        // Second ack and unknown ids answer false, never an error.
        assert!(!broker.ack("orders", &id, "g").await.unwrap());
        assert!(!broker.ack("orders", "missing", "g").await.unwrap());
        assert!(!broker.ack("orders", &id, "other-group").await.unwrap());
    }

    #[tokio::test]
    async fn nack_schedules_redelivery_after_backoff() {
        let config = BrokerConfig {
            base_delay_ms: 30,
            ..BrokerConfig::default()
        };
        let broker = broker_with(config);
        // Create the group at the tail, then publish into it.
        assert!(broker.read("orders", "g", 1).await.unwrap().is_empty());
        broker.publish("orders", &payload(3)).await.unwrap();
        let batch = broker.read("orders", "g", 1).await.unwrap();
        let id = batch[0].id.clone();

        assert!(broker.nack("orders", &id, "g").await.unwrap());
        // Not due yet: delay is base * 2^1 = 60ms.
        assert!(broker.read("orders", "g", 1).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(90)).await;
        let redelivered = broker.read("orders", "g", 1).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].id, id);
    }

    #[tokio::test]
    async fn second_nack_past_the_ceiling_dead_letters() {
        let config = BrokerConfig {
            max_retries: 1,
            base_delay_ms: 1,
            group_start: DeliveryStart::Beginning,
            ..BrokerConfig::default()
        };
        let broker = broker_with(config);
        broker.publish("orders", &payload(7)).await.unwrap();

        let id = broker.read("orders", "g", 1).await.unwrap()[0].id.clone();
        assert!(broker.nack("orders", &id, "g").await.unwrap());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let redelivered = broker.read("orders", "g", 1).await.unwrap();
        assert_eq!(redelivered.len(), 1);

        // Second nack crosses the ceiling: dead-lettered, gone from pending.
        assert!(broker.nack("orders", &id, "g").await.unwrap());
        let dead = broker.read_dead_letters("orders", 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].original_id, id);
        assert_eq!(dead[0].payload.id, "msg-7");

        let info = broker.info("orders").await.unwrap().unwrap();
        assert_eq!(info.groups[0].pending, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(broker.read("orders", "g", 1).await.unwrap().is_empty());
        assert!(!broker.ack("orders", &id, "g").await.unwrap());
    }

    #[tokio::test]
    async fn idle_in_flight_records_are_reclaimed() {
        let config = BrokerConfig {
            claim_timeout_ms: 40,
            group_start: DeliveryStart::Beginning,
            ..BrokerConfig::default()
        };
        let broker = broker_with(config);
        broker.publish("orders", &payload(1)).await.unwrap();

        let first = broker.read_as("orders", "g", "crashed", 1).await.unwrap();
        assert_eq!(first.len(), 1);
        // Too fresh to steal.
        assert!(broker.read_as("orders", "g", "helper", 1).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let reclaimed = broker.read_as("orders", "g", "helper", 1).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, first[0].id);
    }

    #[tokio::test]
    async fn blocking_read_serves_own_pending_first() {
        let config = BrokerConfig {
            group_start: DeliveryStart::Beginning,
            ..BrokerConfig::default()
        };
        let broker = broker_with(config);
        broker.publish("orders", &payload(1)).await.unwrap();

        let claimed = broker.read_as("orders", "g", "alice", 1).await.unwrap();
        assert_eq!(claimed.len(), 1);

        // Unacknowledged entries come back immediately, without blocking.
        let again = broker
            .read_blocking("orders", "g", "alice", Duration::from_secs(5), 10)
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, claimed[0].id);
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_publish() {
        let broker = Arc::new(broker());
        // Create the group at the current tail.
        assert!(broker.read("orders", "g", 1).await.unwrap().is_empty());

        let publisher = broker.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            publisher.publish("orders", &payload(9)).await.unwrap();
        });

        let started = Instant::now();
        let batch = broker
            .read_blocking("orders", "g", "alice", Duration::from_secs(5), 1)
            .await
            .unwrap();
        handle.await.unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload.id, "msg-9");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn blocking_read_times_out_empty() {
        let broker = broker();
        let batch = broker
            .read_blocking("orders", "g", "alice", Duration::from_millis(30), 1)
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn positional_reads_replay_and_resume() {
        let broker = broker();
        let mut ids = Vec::new();
        for n in 1..=3 {
            ids.push(broker.publish("orders", &payload(n)).await.unwrap());
        }

        let all = broker.read_from("orders", None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].payload.id, "msg-1");

        let tail = broker.read_from("orders", Some(&ids[1]), 10).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].payload.id, "msg-3");

        // Unknown positions replay from the beginning rather than lose data.
        let replayed = broker.read_from("orders", Some("unknown"), 10).await.unwrap();
        assert_eq!(replayed.len(), 3);
    }

    #[tokio::test]
    async fn degraded_broker_shares_one_cursor_across_groups() {
        let broker = MemoryBroker::with_capabilities(
            BrokerConfig::default(),
            Capabilities::NONE,
        )
        .unwrap();
        broker.publish("orders", &payload(1)).await.unwrap();
        broker.publish("orders", &payload(2)).await.unwrap();

        let a = broker.read("orders", "billing", 1).await.unwrap();
        let b = broker.read("orders", "shipping", 1).await.unwrap();
        assert_eq!(a[0].payload.id, "msg-1");
        assert_eq!(b[0].payload.id, "msg-2");

        // No ownership records exist, so acks answer false.
        assert!(!broker.ack("orders", &a[0].id, "billing").await.unwrap());
    }

    #[tokio::test]
    async fn close_fails_operations_and_wakes_blockers() {
        let broker = Arc::new(broker());
        assert!(broker.read("orders", "g", 1).await.unwrap().is_empty());

        let blocked = broker.clone();
        let reader = tokio::spawn(async move {
            blocked
                .read_blocking("orders", "g", "alice", Duration::from_secs(30), 1)
                .await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        broker.close().await;

        let result = reader.await.unwrap();
        assert!(matches!(result, Err(BrokerError::Closed)));
        assert!(matches!(
            broker.publish("orders", &payload(1)).await,
            Err(BrokerError::Closed)
        ));
        // Ack keeps its never-raises contract even when closed.
        assert!(!broker.ack("orders", "id", "g").await.unwrap());
        assert!(!broker.health_stats().healthy);
    }

    #[tokio::test]
    async fn info_reports_groups_and_pending() {
        let config = BrokerConfig {
            group_start: DeliveryStart::Beginning,
            ..BrokerConfig::default()
        };
        let broker = broker_with(config);
        broker.publish("orders", &payload(1)).await.unwrap();
        broker.publish("orders", &payload(2)).await.unwrap();

        broker.read_as("orders", "billing", "alice", 1).await.unwrap();
        let last = broker.read_as("orders", "billing", "bob", 1).await.unwrap();

        let info = broker.info("orders").await.unwrap().unwrap();
        assert_eq!(info.stream, "orders");
        assert_eq!(info.length, 2);
        assert_eq!(info.groups.len(), 1);
        let group = &info.groups[0];
        assert_eq!(group.name, "billing");
        assert_eq!(group.consumers, vec!["alice", "bob"]);
        assert_eq!(group.pending, 2);
        assert_eq!(group.last_delivered_id.as_deref(), Some(last[0].id.as_str()));

        assert!(broker.info("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persistence_claim_is_rejected_at_construction() {
        let result = MemoryBroker::with_capabilities(
            BrokerConfig::default(),
            Capabilities::PERSISTENCE,
        );
        assert!(matches!(result, Err(BrokerError::Config(_))));
    }
}
