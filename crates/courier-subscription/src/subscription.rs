//! Position-tracking subscription loop.
//!
//! A subscription reads a stream positionally (no consumer group), hands
//! each message to its handler, and remembers how far it got. Poisoned
//! messages are retried a bounded number of times, dead-lettered, and then
//! left behind; the position advances past them so one bad payload never
//! blocks the stream.

use crate::config::SubscriptionConfig;
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::handler::MessageHandler;
use crate::position::PositionHandle;
use courier_broker::{Broker, BrokerError, Capabilities, Delivery};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Lifecycle of a subscription. `run()` is valid exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Created,
    Running,
    Stopped,
}

/// One handler bound to one stream.
pub struct Subscription {
    id: String,
    stream: String,
    broker: Arc<Broker>,
    handler: Arc<dyn MessageHandler>,
    positions: PositionHandle,
    config: SubscriptionConfig,
    state: Mutex<SubscriptionState>,
    stop_tx: watch::Sender<bool>,
}

impl Subscription {
    /// `id` keys the stored read position, so it must be stable across
    /// restarts for resume to work.
    pub fn new(
        id: impl Into<String>,
        stream: impl Into<String>,
        broker: Arc<Broker>,
        handler: Arc<dyn MessageHandler>,
        positions: PositionHandle,
        config: SubscriptionConfig,
    ) -> SubscriptionResult<Self> {
        config.validate()?;
        let id = id.into();
        let stream = stream.into();
        if id.is_empty() {
            return Err(SubscriptionError::Config(
                "subscriber id must not be empty".to_string(),
            ));
        }
        if stream.is_empty() {
            return Err(SubscriptionError::Config(
                "stream must not be empty".to_string(),
            ));
        }
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            id,
            stream,
            broker,
            handler,
            positions,
            config,
            state: Mutex::new(SubscriptionState::Created),
            stop_tx,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Signal `run()` to exit. The in-flight dispatch finishes first.
    /// Safe to call before `run()`; the flag is checked at loop entry.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Consume the stream until stopped. Valid only from CREATED; a failed
    /// position load leaves the state CREATED so the call can be retried.
    pub async fn run(&self) -> SubscriptionResult<()> {
        let mut position = self.positions.load(&self.id)?;
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                SubscriptionState::Created => *state = SubscriptionState::Running,
                other => {
                    return Err(SubscriptionError::State(format!(
                        "cannot start from {:?}",
                        other
                    )))
                }
            }
        }

        match &position {
            Some(p) => info!(
                subscriber_id = %self.id,
                stream = %self.stream,
                position = %p,
                "subscription resuming"
            ),
            None => info!(
                subscriber_id = %self.id,
                stream = %self.stream,
                "subscription starting from the beginning of the stream"
            ),
        }

        let blocking = self
            .broker
            .capabilities()
            .supports(Capabilities::BLOCKING_READ);
        let mut stop_rx = self.stop_tx.subscribe();
        let mut since_flush = 0usize;
        let mut dirty = false;

        while !*stop_rx.borrow() {
            let batch = if blocking {
                self.broker
                    .read_from_blocking(
                        &self.stream,
                        position.as_deref(),
                        self.config.blocking_timeout(),
                        self.config.messages_per_tick,
                    )
                    .await
            } else {
                self.broker
                    .read_from(
                        &self.stream,
                        position.as_deref(),
                        self.config.messages_per_tick,
                    )
                    .await
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(BrokerError::Closed) => {
                    info!(subscriber_id = %self.id, "broker closed, stopping subscription");
                    break;
                }
                Err(e) => {
                    warn!(subscriber_id = %self.id, error = %e, "read failed");
                    self.idle(&mut stop_rx).await;
                    continue;
                }
            };

            if batch.is_empty() {
                if !blocking {
                    self.idle(&mut stop_rx).await;
                }
                continue;
            }

            for delivery in &batch {
                self.dispatch(delivery).await;
                position = Some(delivery.id.clone());
                dirty = true;
                since_flush += 1;
                if since_flush >= self.config.position_update_interval {
                    self.flush(&position, &mut dirty);
                    since_flush = 0;
                }
            }
        }

        self.flush(&position, &mut dirty);
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = SubscriptionState::Stopped;
        info!(subscriber_id = %self.id, stream = %self.stream, "subscription stopped");
        Ok(())
    }

    /// Hand one message to the handler, retrying on failure. A message
    /// that exhausts its retries is dead-lettered (when enabled) and
    /// dropped; the caller advances past it either way.
    async fn dispatch(&self, delivery: &Delivery) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.handler.handle(&delivery.payload).await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!(
                            subscriber_id = %self.id,
                            message_id = %delivery.id,
                            attempt,
                            "handler recovered"
                        );
                    }
                    return;
                }
                Err(e) if attempt > self.config.max_retries => {
                    error!(
                        subscriber_id = %self.id,
                        message_id = %delivery.id,
                        attempts = attempt,
                        error = %e,
                        "handler failed, giving up on the message"
                    );
                    if self.config.dead_letter_enabled {
                        if let Err(dl_err) = self
                            .broker
                            .dead_letter(
                                &self.stream,
                                &delivery.payload,
                                &delivery.id,
                                &e.to_string(),
                            )
                            .await
                        {
                            warn!(
                                subscriber_id = %self.id,
                                message_id = %delivery.id,
                                error = %dl_err,
                                "dead-letter write failed"
                            );
                        }
                    }
                    return;
                }
                Err(e) => {
                    warn!(
                        subscriber_id = %self.id,
                        message_id = %delivery.id,
                        attempt,
                        error = %e,
                        "handler failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay()).await;
                }
            }
        }
    }

    fn flush(&self, position: &Option<String>, dirty: &mut bool) {
        if !*dirty {
            return;
        }
        if let Some(position) = position {
            match self.positions.save(&self.id, &self.stream, position) {
                Ok(()) => *dirty = false,
                Err(e) => {
                    warn!(subscriber_id = %self.id, error = %e, "position flush failed");
                }
            }
        }
    }

    /// Sleep one tick, waking early on stop.
    async fn idle(&self, stop_rx: &mut watch::Receiver<bool>) {
        let _ = tokio::time::timeout(self.config.tick_interval(), stop_rx.changed()).await;
    }
}

#[cfg(test)]
mod construction_tests {
    use super::*;
    use crate::handler::RecordingHandler;
    use crate::position::MemoryPositionStore;
    use courier_broker::BrokerConfig;

    fn subscription(id: &str, stream: &str) -> SubscriptionResult<Subscription> {
        Subscription::new(
            id,
            stream,
            Arc::new(Broker::memory(BrokerConfig::default()).unwrap()),
            Arc::new(RecordingHandler::new()),
            Arc::new(MemoryPositionStore::new()),
            SubscriptionConfig::default(),
        )
    }

    #[tokio::test]
    async fn starts_in_the_created_state() {
        let sub = subscription("sub-1", "orders").unwrap();
        assert_eq!(sub.state(), SubscriptionState::Created);
        assert_eq!(sub.id(), "sub-1");
        assert_eq!(sub.stream(), "orders");
    }

    #[tokio::test]
    async fn empty_id_or_stream_is_rejected() {
        assert!(matches!(
            subscription("", "orders"),
            Err(SubscriptionError::Config(_))
        ));
        assert!(matches!(
            subscription("sub-1", ""),
            Err(SubscriptionError::Config(_))
        ));
    }
}
