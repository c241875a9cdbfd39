//! Handler retries, dead-lettering, and poison isolation.

use super::harness::{fast_config, publish_n, spawn_run, wait_for_seen, wait_until, Fixture};
use crate::config::SubscriptionConfig;
use crate::position::PositionStore;
use crate::subscription::Subscription;
use courier_core::MessagePayload;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn a_poisoned_message_is_dead_lettered_and_left_behind() {
    let fixture = Fixture::new();
    let ids = publish_n(&fixture.broker, "orders", 3).await;

    let handled: Arc<Mutex<Vec<String>>> = Arc::default();
    let handler = {
        let handled = handled.clone();
        move |payload: &MessagePayload| {
            if payload.id == "msg-1" {
                anyhow::bail!("cannot apply msg-1");
            }
            handled.lock().unwrap().push(payload.id.clone());
            Ok(())
        }
    };

    let config = SubscriptionConfig {
        max_retries: 1,
        ..fast_config()
    };
    let sub = Arc::new(
        Subscription::new(
            "sub-1",
            "orders",
            fixture.broker.clone(),
            Arc::new(handler),
            fixture.positions.clone(),
            config,
        )
        .unwrap(),
    );
    let task = spawn_run(&sub);

    wait_until("the healthy messages to land", || {
        handled.lock().unwrap().len() >= 2
    })
    .await;
    sub.stop();
    task.await.unwrap().unwrap();

    // The poison pill did not block its neighbors.
    assert_eq!(*handled.lock().unwrap(), vec!["msg-0", "msg-2"]);

    // It went to dead-letter storage with the handler's reason.
    let dead = fixture.broker.read_dead_letters("orders", 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload.id, "msg-1");
    assert_eq!(dead[0].original_id, ids[1]);
    assert!(dead[0].reason.contains("cannot apply msg-1"));

    // And the position moved past it.
    assert_eq!(
        fixture.positions.load("sub-1").unwrap().as_deref(),
        Some(ids[2].as_str())
    );
}

#[tokio::test]
async fn transient_failures_recover_within_the_retry_budget() {
    let fixture = Fixture::new();
    publish_n(&fixture.broker, "orders", 1).await;

    fixture.handler.fail_times(2);
    let config = SubscriptionConfig {
        max_retries: 3,
        ..fast_config()
    };
    let sub = fixture.subscription("sub-1", "orders", config);
    let task = spawn_run(&sub);

    wait_for_seen(&fixture.handler, 1).await;
    sub.stop();
    task.await.unwrap().unwrap();

    assert_eq!(fixture.handler.seen_count(), 1);
    let dead = fixture.broker.read_dead_letters("orders", 10).await.unwrap();
    assert!(dead.is_empty());
}

#[tokio::test]
async fn disabled_dead_lettering_skips_the_quarantine_write() {
    let fixture = Fixture::new();
    let ids = publish_n(&fixture.broker, "orders", 1).await;

    let attempts = Arc::new(AtomicU32::new(0));
    let handler = {
        let attempts = attempts.clone();
        move |_: &MessagePayload| -> anyhow::Result<()> {
            attempts.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("always rejected")
        }
    };

    let config = SubscriptionConfig {
        max_retries: 1,
        dead_letter_enabled: false,
        ..fast_config()
    };
    let sub = Arc::new(
        Subscription::new(
            "sub-1",
            "orders",
            fixture.broker.clone(),
            Arc::new(handler),
            fixture.positions.clone(),
            config,
        )
        .unwrap(),
    );
    let task = spawn_run(&sub);

    // Initial attempt plus one retry, then the loop moves on.
    wait_until("the retry budget to run out", || {
        attempts.load(Ordering::SeqCst) >= 2
    })
    .await;
    sub.stop();
    task.await.unwrap().unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let dead = fixture.broker.read_dead_letters("orders", 10).await.unwrap();
    assert!(dead.is_empty());
    assert_eq!(
        fixture.positions.load("sub-1").unwrap().as_deref(),
        Some(ids[0].as_str())
    );
}
