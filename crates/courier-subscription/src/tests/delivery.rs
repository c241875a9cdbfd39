//! Ordering, live pickup, and lifecycle.

use super::harness::{fast_config, publish_n, spawn_run, wait_for_seen, Fixture};
use crate::error::SubscriptionError;
use crate::subscription::SubscriptionState;
use std::time::Duration;

#[tokio::test]
async fn replays_the_backlog_in_publish_order() {
    let fixture = Fixture::new();
    publish_n(&fixture.broker, "orders", 3).await;

    let sub = fixture.subscription("sub-1", "orders", fast_config());
    let task = spawn_run(&sub);

    wait_for_seen(&fixture.handler, 3).await;
    sub.stop();
    task.await.unwrap().unwrap();

    let ids: Vec<String> = fixture.handler.seen().into_iter().map(|p| p.id).collect();
    assert_eq!(ids, vec!["msg-0", "msg-1", "msg-2"]);
}

#[tokio::test]
async fn picks_up_messages_published_while_running() {
    let fixture = Fixture::new();
    let sub = fixture.subscription("sub-1", "orders", fast_config());
    let task = spawn_run(&sub);

    // Let the loop reach its blocking read before publishing.
    tokio::time::sleep(Duration::from_millis(20)).await;
    publish_n(&fixture.broker, "orders", 2).await;

    wait_for_seen(&fixture.handler, 2).await;
    sub.stop();
    task.await.unwrap().unwrap();

    let ids: Vec<String> = fixture.handler.seen().into_iter().map(|p| p.id).collect();
    assert_eq!(ids, vec!["msg-0", "msg-1"]);
}

#[tokio::test]
async fn run_is_valid_exactly_once() {
    let fixture = Fixture::new();
    let sub = fixture.subscription("sub-1", "orders", fast_config());
    let task = spawn_run(&sub);

    // A second run while the first is live is rejected.
    super::harness::wait_until("the subscription to start", || {
        sub.state() == SubscriptionState::Running
    })
    .await;
    assert!(matches!(
        sub.run().await,
        Err(SubscriptionError::State(_))
    ));

    sub.stop();
    task.await.unwrap().unwrap();
    assert_eq!(sub.state(), SubscriptionState::Stopped);

    // And so is a run after stopping.
    assert!(matches!(
        sub.run().await,
        Err(SubscriptionError::State(_))
    ));
}

#[tokio::test]
async fn stop_interrupts_an_idle_subscription() {
    let fixture = Fixture::new();
    let sub = fixture.subscription("sub-1", "orders", fast_config());
    let task = spawn_run(&sub);

    tokio::time::sleep(Duration::from_millis(20)).await;
    sub.stop();

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("subscription did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn a_closed_broker_stops_the_loop() {
    let fixture = Fixture::new();
    publish_n(&fixture.broker, "orders", 1).await;

    let sub = fixture.subscription("sub-1", "orders", fast_config());
    let task = spawn_run(&sub);
    wait_for_seen(&fixture.handler, 1).await;

    fixture.broker.close().await;

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("subscription did not notice the closed broker")
        .unwrap()
        .unwrap();
    assert_eq!(sub.state(), SubscriptionState::Stopped);
}
