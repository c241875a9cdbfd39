//! Broker port: capability-described message transport.
//!
//! Two backing kinds stand behind one closed [`Broker`] enum: an in-process
//! buffered broker for tests and single-process deployments, and a Redis
//! Streams broker for persistent ordered delivery. Callers branch on
//! [`Capabilities`], never on the concrete kind. Absent capabilities degrade
//! gracefully instead of raising: blocking reads fall back to polling,
//! ack/nack become no-ops answering `Ok(false)`.

pub mod capabilities;
pub mod config;
pub mod error;
pub mod memory;
pub mod redis;
pub mod types;

pub use capabilities::Capabilities;
pub use config::{BrokerConfig, RedisBrokerConfig};
pub use error::{BrokerError, BrokerResult};
pub use memory::MemoryBroker;
pub use self::redis::RedisStreamBroker;
pub use types::{DeadLetter, Delivery, DeliveryStart, GroupInfo, HealthStats, StreamInfo};

use courier_core::MessagePayload;
use std::time::Duration;
use tracing::warn;

/// Poll cadence for brokers without the BLOCKING_READ capability.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The broker port. A closed enum over the two backing kinds; every
/// operation dispatches by variant.
pub enum Broker {
    Memory(MemoryBroker),
    Redis(RedisStreamBroker),
}

impl Broker {
    /// In-process broker with the default capability set.
    pub fn memory(config: BrokerConfig) -> BrokerResult<Self> {
        Ok(Self::Memory(MemoryBroker::new(config)?))
    }

    /// Redis Streams broker.
    pub async fn redis(config: RedisBrokerConfig) -> BrokerResult<Self> {
        Ok(Self::Redis(RedisStreamBroker::connect(config).await?))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Redis(_) => "redis",
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            Self::Memory(broker) => broker.capabilities(),
            Self::Redis(broker) => broker.capabilities(),
        }
    }

    /// Append a message to a stream; returns the assigned identifier.
    ///
    /// Identifiers are opaque: a `"<ms>-<seq>"` entry id for the Redis kind,
    /// a UUID for the in-process kind. Callers never parse them.
    pub async fn publish(&self, stream: &str, payload: &MessagePayload) -> BrokerResult<String> {
        match self {
            Self::Memory(broker) => broker.publish(stream, payload).await,
            Self::Redis(broker) => broker.publish(stream, payload).await,
        }
    }

    /// Consumer-group read as the configured consumer name.
    pub async fn read(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        match self {
            Self::Memory(broker) => broker.read(stream, group, count).await,
            Self::Redis(broker) => broker.read(stream, group, count).await,
        }
    }

    /// Consumer-group read as a named consumer.
    pub async fn read_as(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        match self {
            Self::Memory(broker) => broker.read_as(stream, group, consumer, count).await,
            Self::Redis(broker) => broker.read_as(stream, group, consumer, count).await,
        }
    }

    /// The next message for a group, if one is ready.
    pub async fn get_next(&self, stream: &str, group: &str) -> BrokerResult<Option<Delivery>> {
        Ok(self.read(stream, group, 1).await?.pop())
    }

    /// Blocking consumer-group read. Serves the consumer's own pending
    /// entries first. Brokers without BLOCKING_READ poll instead.
    pub async fn read_blocking(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        timeout: Duration,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        if !self.capabilities().supports(Capabilities::BLOCKING_READ) {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let batch = self.read_as(stream, group, consumer, count).await?;
                if !batch.is_empty() {
                    return Ok(batch);
                }
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    return Ok(Vec::new());
                }
                tokio::time::sleep_until(now + POLL_INTERVAL.min(deadline - now)).await;
            }
        }
        match self {
            Self::Memory(broker) => {
                broker
                    .read_blocking(stream, group, consumer, timeout, count)
                    .await
            }
            Self::Redis(broker) => {
                broker
                    .read_blocking(stream, group, consumer, timeout, count)
                    .await
            }
        }
    }

    /// Acknowledge a delivered message.
    ///
    /// Never raises: unknown identifiers, brokers without ACK_NACK, internal
    /// faults and closed brokers all answer `Ok(false)`.
    pub async fn ack(&self, stream: &str, id: &str, group: &str) -> BrokerResult<bool> {
        if !self.capabilities().supports(Capabilities::ACK_NACK) {
            return Ok(false);
        }
        let result = match self {
            Self::Memory(broker) => broker.ack(stream, id, group).await,
            Self::Redis(broker) => broker.ack(stream, id, group).await,
        };
        match result {
            Ok(removed) => Ok(removed),
            Err(e) => {
                warn!(
                    stream = %stream,
                    message_id = %id,
                    group = %group,
                    error = %e,
                    "ack failed, treating as not acknowledged"
                );
                Ok(false)
            }
        }
    }

    /// Negatively acknowledge a delivered message: schedules redelivery with
    /// exponential backoff, dead-letters once past the retry ceiling.
    ///
    /// Same never-raises contract as [`Broker::ack`].
    pub async fn nack(&self, stream: &str, id: &str, group: &str) -> BrokerResult<bool> {
        if !self.capabilities().supports(Capabilities::ACK_NACK) {
            return Ok(false);
        }
        let result = match self {
            Self::Memory(broker) => broker.nack(stream, id, group).await,
            Self::Redis(broker) => broker.nack(stream, id, group).await,
        };
        match result {
            Ok(released) => Ok(released),
            Err(e) => {
                warn!(
                    stream = %stream,
                    message_id = %id,
                    group = %group,
                    error = %e,
                    "nack failed, ownership dropped without reschedule"
                );
                Ok(false)
            }
        }
    }

    /// Positional read: entries strictly after `after`, in append order.
    /// `None` replays from the beginning of the retained log.
    pub async fn read_from(
        &self,
        stream: &str,
        after: Option<&str>,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        match self {
            Self::Memory(broker) => broker.read_from(stream, after, count).await,
            Self::Redis(broker) => broker.read_from(stream, after, count).await,
        }
    }

    /// Blocking positional read. Brokers without BLOCKING_READ poll instead.
    pub async fn read_from_blocking(
        &self,
        stream: &str,
        after: Option<&str>,
        timeout: Duration,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        if !self.capabilities().supports(Capabilities::BLOCKING_READ) {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let batch = self.read_from(stream, after, count).await?;
                if !batch.is_empty() {
                    return Ok(batch);
                }
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    return Ok(Vec::new());
                }
                tokio::time::sleep_until(now + POLL_INTERVAL.min(deadline - now)).await;
            }
        }
        match self {
            Self::Memory(broker) => {
                broker
                    .read_from_blocking(stream, after, timeout, count)
                    .await
            }
            Self::Redis(broker) => {
                broker
                    .read_from_blocking(stream, after, timeout, count)
                    .await
            }
        }
    }

    /// Quarantine a message (subscription poison path).
    pub async fn dead_letter(
        &self,
        stream: &str,
        payload: &MessagePayload,
        original_id: &str,
        reason: &str,
    ) -> BrokerResult<()> {
        match self {
            Self::Memory(broker) => {
                broker
                    .dead_letter(stream, payload, original_id, reason)
                    .await
            }
            Self::Redis(broker) => {
                broker
                    .dead_letter(stream, payload, original_id, reason)
                    .await
            }
        }
    }

    /// Read up to `count` dead letters for a stream, oldest first.
    pub async fn read_dead_letters(
        &self,
        stream: &str,
        count: usize,
    ) -> BrokerResult<Vec<DeadLetter>> {
        match self {
            Self::Memory(broker) => broker.read_dead_letters(stream, count).await,
            Self::Redis(broker) => broker.read_dead_letters(stream, count).await,
        }
    }

    /// Per-stream diagnostics; observability only, never a correctness
    /// input. `None` for unknown streams.
    pub async fn info(&self, stream: &str) -> BrokerResult<Option<StreamInfo>> {
        match self {
            Self::Memory(broker) => broker.info(stream).await,
            Self::Redis(broker) => broker.info(stream).await,
        }
    }

    pub async fn health_stats(&self) -> HealthStats {
        match self {
            Self::Memory(broker) => broker.health_stats(),
            Self::Redis(broker) => broker.health_stats().await,
        }
    }

    /// Mark the broker closed. Later operations answer a connection-class
    /// error; ack/nack keep degrading to `Ok(false)`.
    pub async fn close(&self) {
        match self {
            Self::Memory(broker) => broker.close().await,
            Self::Redis(broker) => broker.close(),
        }
    }
}
