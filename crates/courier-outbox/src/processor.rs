//! Outbox processor loop.
//!
//! Drains ready entries from the store and publishes them through the
//! broker. Multiple processors may run against the same store; the entry
//! lease is the only mutual-exclusion primitive, so a worker that dies
//! mid-publish releases its claim when the lease lapses.

use crate::config::OutboxConfig;
use crate::entry::{ClaimOutcome, OutboxEntry, OutboxStatus};
use crate::error::OutboxResult;
use crate::store::StoreHandle;
use courier_broker::Broker;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Publishes staged outbox entries to the broker.
pub struct OutboxProcessor {
    store: StoreHandle,
    broker: Arc<Broker>,
    config: OutboxConfig,
    worker_id: String,
    stop_tx: watch::Sender<bool>,
}

impl OutboxProcessor {
    pub fn new(
        store: StoreHandle,
        broker: Arc<Broker>,
        config: OutboxConfig,
    ) -> OutboxResult<Self> {
        config.validate()?;
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            store,
            broker,
            config,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            stop_tx,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Stage an entry with this processor's configured retry ceiling.
    ///
    /// Embedders that share a transaction with their business write call
    /// the store's `add` directly and apply their own defaults.
    pub fn stage(&self, entry: OutboxEntry) -> OutboxResult<OutboxEntry> {
        self.store
            .add(entry.with_max_retries(self.config.max_retries))
    }

    /// Signal `run()` to exit after the current tick. Safe to call before
    /// `run()`; the flag is checked at loop entry.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Tick until stopped. Tick errors are logged and the loop stays alive.
    pub async fn run(&self) {
        if !self.config.enable_outbox {
            info!("outbox processing is disabled");
            return;
        }

        info!(
            worker_id = %self.worker_id,
            tick_interval_ms = self.config.tick_interval_ms,
            messages_per_tick = self.config.messages_per_tick,
            "outbox processor started"
        );

        let mut stop_rx = self.stop_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*stop_rx.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(0) => {}
                        Ok(published) => debug!(published, "outbox tick complete"),
                        Err(e) => warn!(error = %e, "outbox tick failed"),
                    }
                }
                _ = stop_rx.changed() => {}
            }
        }
        info!(worker_id = %self.worker_id, "outbox processor stopped");
    }

    /// Drain one batch of ready entries. Returns the number published.
    ///
    /// Public so embedders can drain on demand instead of running the loop.
    pub async fn tick(&self) -> OutboxResult<usize> {
        let ready = self.store.find_ready(self.config.messages_per_tick)?;
        let mut published = 0;

        for candidate in ready {
            let outcome = match self.store.claim(
                &candidate.message_id,
                &self.worker_id,
                self.config.lock_duration(),
            ) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(message_id = %candidate.message_id, error = %e, "claim failed");
                    continue;
                }
            };
            match outcome {
                ClaimOutcome::Success => {}
                ClaimOutcome::AlreadyLocked => {
                    debug!(
                        message_id = %candidate.message_id,
                        "entry claimed by another worker"
                    );
                    continue;
                }
                outcome => {
                    debug!(message_id = %candidate.message_id, ?outcome, "entry not claimable");
                    continue;
                }
            }

            // Reload so the publish works on the claimed state.
            let mut entry = match self.store.get(&candidate.message_id) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    warn!(message_id = %candidate.message_id, error = %e, "reload failed");
                    continue;
                }
            };

            if self.publish_one(&mut entry).await {
                published += 1;
            }
        }

        Ok(published)
    }

    async fn publish_one(&self, entry: &mut OutboxEntry) -> bool {
        let target = self.route_stream(entry);
        let payload = entry.wire_payload();

        match self.broker.publish(&target, &payload).await {
            Ok(id) if !id.is_empty() => {
                entry.mark_published();
                if let Err(e) = self.store.update(entry) {
                    warn!(
                        message_id = %entry.message_id,
                        error = %e,
                        "published but could not persist the status"
                    );
                }
                debug!(
                    message_id = %entry.message_id,
                    stream = %target,
                    broker_id = %id,
                    "outbox entry published"
                );
                true
            }
            Ok(_) => {
                self.record_failure(entry, "broker returned an empty identifier");
                false
            }
            Err(e) => {
                self.record_failure(entry, &e.to_string());
                false
            }
        }
    }

    fn record_failure(&self, entry: &mut OutboxEntry, cause: &str) {
        warn!(
            message_id = %entry.message_id,
            retry_count = entry.retry_count,
            error = cause,
            "outbox publish failed"
        );
        entry.mark_failed(cause, self.config.base_delay());
        if entry.status == OutboxStatus::Abandoned {
            error!(
                message_id = %entry.message_id,
                retry_count = entry.retry_count,
                "outbox entry abandoned"
            );
        }
        // Swallowed on purpose: the lease lapse surfaces this entry again
        // next cycle, so a store fault here must not kill the loop.
        if let Err(e) = self.store.update(entry) {
            warn!(
                message_id = %entry.message_id,
                error = %e,
                "could not persist the failure"
            );
        }
    }

    /// Target stream for an entry, honoring the priority lanes.
    fn route_stream(&self, entry: &OutboxEntry) -> String {
        if entry.stream_name.is_empty() {
            warn!(
                message_id = %entry.message_id,
                "entry staged without a stream category, publishing with an empty stream name"
            );
            return String::new();
        }
        let lanes = &self.config.priority_lanes;
        if lanes.enabled && entry.priority < lanes.threshold {
            format!("{}:{}", entry.stream_name, lanes.backfill_suffix)
        } else {
            entry.stream_name.clone()
        }
    }
}
