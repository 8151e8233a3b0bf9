//! Relay pool: ensuring relays, waiting for connections, live subscriptions

use super::fetch::eventually;
use super::*;
use nostr::{EventTemplate, Keys};
use nostr_client::{PoolConfig, RelayPool};
use runstr_core::subscription;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test]
async fn test_ensure_relays_is_idempotent() {
    let relay = MockRelay::start(vec![]).await;
    let pool = RelayPool::new();
    let urls = vec![relay.url.clone(), format!("{}/", relay.url), relay.url.clone()];

    pool.ensure_relays(&urls, Duration::from_secs(1)).await;
    assert_eq!(pool.relay_urls().await, vec![relay.url.clone()]);
    assert!(pool.is_connected(&relay.url).await);

    pool.ensure_relays(&urls, Duration::from_secs(1)).await;
    assert_eq!(pool.relay_urls().await.len(), 1);
    pool.disconnect_all().await;
}

#[tokio::test]
async fn test_ensure_keeps_open_subscriptions() {
    let relay_a = MockRelay::start(vec![]).await;
    let relay_b = MockRelay::start(vec![]).await;
    let pool = RelayPool::new();
    pool.ensure_relays(&[relay_a.url.clone()], Duration::from_secs(1))
        .await;

    let id = pool
        .subscribe(vec![Filter::new().kinds(vec![9])], &[relay_a.url.clone()])
        .await
        .unwrap();
    assert!(eventually(|| relay_a.requests().contains(&id)).await);

    pool.ensure_relays(
        &[relay_a.url.clone(), relay_b.url.clone()],
        Duration::from_secs(1),
    )
    .await;
    assert_eq!(pool.connected_count().await, 2);
    assert!(relay_a.closed().is_empty());
    assert_eq!(relay_a.requests(), vec![id.clone()]);

    pool.unsubscribe(&id).await;
    assert!(eventually(|| relay_a.closed() == vec![id.clone()]).await);
    pool.disconnect_all().await;
}

#[tokio::test]
async fn test_ensure_does_not_block_past_grace() {
    let pool = RelayPool::new();
    let started = Instant::now();
    pool.ensure_relays(&[unreachable_url()], Duration::from_millis(50))
        .await;
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_relay_that_comes_back_is_redialled() {
    let mut config = PoolConfig::default();
    config.relay.reconnect_delay = Duration::from_millis(50);
    let pool = RelayPool::with_config(config);
    let url = unreachable_url();

    pool.ensure_relays(&[url.clone()], Duration::from_millis(200))
        .await;
    assert_eq!(pool.connected_count().await, 0);

    let relay = MockRelay::start_at(&url, vec![event("back", "runner", 1, 10, vec![])]).await;
    let deadline = Instant::now() + Duration::from_secs(2);
    while !pool.is_connected(&url).await && Instant::now() < deadline {
        pool.ensure_relays(&[url.clone()], Duration::from_millis(200))
            .await;
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(pool.wait_for_connected(1, Duration::from_secs(1)).await);

    let events = pool
        .query(vec![Filter::new().kinds(vec![1])], &[url.clone()], Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(relay.requests().len(), 1);
    pool.disconnect_all().await;
}

#[tokio::test]
async fn test_wait_for_connected() {
    let pool = RelayPool::new();
    pool.ensure_relays(&[unreachable_url()], Duration::ZERO).await;
    let started = Instant::now();
    assert!(!pool.wait_for_connected(1, Duration::from_millis(200)).await);
    assert!(started.elapsed() < Duration::from_millis(700));

    let relay = MockRelay::start(vec![]).await;
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.wait_for_connected(1, Duration::from_secs(2)).await })
    };
    pool.ensure_relays(&[relay.url.clone()], Duration::ZERO).await;
    assert!(waiter.await.unwrap());
    pool.disconnect_all().await;
}

#[tokio::test]
async fn test_live_subscription_delivers_published_events() {
    let relay = MockRelay::start(vec![event("old", "runner", 1, 10, vec![vec!["t", "runstr"]])]).await;
    let pool = RelayPool::new();
    let relays = vec![relay.url.clone()];

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let live = subscription::subscribe(
        &pool,
        &relays,
        Filter::new().kinds(vec![1]).hashtags(vec!["runstr".into()]),
        None,
        move |event| sink.lock().push(event.id),
        Duration::from_secs(1),
    )
    .await;
    assert!(live.is_active());
    assert!(eventually(|| received.lock().len() == 1).await);

    let keys = Keys::generate();
    let fresh = keys
        .sign(&EventTemplate::new(1, "Tempo run").tag(["t", "runstr"]))
        .unwrap();
    pool.publish(&fresh, &relays).await.unwrap();
    let off_topic = keys.sign(&EventTemplate::new(1, "Lunch")).unwrap();
    pool.publish(&off_topic, &relays).await.unwrap();

    assert!(eventually(|| received.lock().len() == 2).await);
    assert_eq!(received.lock()[1], fresh.id);

    let id = live.id().unwrap().to_string();
    live.unsubscribe().await;
    assert!(eventually(|| relay.closed().contains(&id)).await);
    pool.disconnect_all().await;
}
