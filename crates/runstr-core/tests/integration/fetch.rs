//! Dual-path fetch against live sockets

use super::*;
use nostr_client::{FETCH_SUBSCRIPTION_PREFIX, RelayPool};
use runstr_core::{
    CoreError, FallbackFetcher, FetchPath, FetchRequest, Fetcher, PooledFetcher, RawFetcher,
};
use std::time::Duration;
use tokio::time::{Instant, sleep};

fn note(id: &str, created_at: u64) -> Event {
    event(id, "runner", 1, created_at, vec![vec!["t", "runstr"]])
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn runstr_filter() -> Filter {
    Filter::new()
        .kinds(vec![1])
        .hashtags(vec!["runstr".to_string()])
}

#[tokio::test]
async fn test_raw_fetch_dedupes_across_relays() {
    let relay_a = MockRelay::start(vec![note("a", 10), note("b", 20)]).await;
    let relay_b = MockRelay::start(vec![note("b", 20), note("c", 30)]).await;

    let request = FetchRequest::new(runstr_filter())
        .relays(vec![relay_a.url.clone(), relay_b.url.clone()])
        .timeout(Duration::from_secs(2));
    let report = RawFetcher::new(Duration::from_secs(2)).fetch(&request).await;

    let mut ids: Vec<&str> = report.events.iter().map(|e| e.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(report.relays_attempted, 2);
    assert_eq!(report.relays_responded, 2);
    assert_eq!(report.path, FetchPath::Raw);

    for relay in [&relay_a, &relay_b] {
        assert!(eventually(|| relay.closed().len() == 1).await);
        assert!(relay.closed()[0].starts_with(FETCH_SUBSCRIPTION_PREFIX));
    }
}

#[tokio::test]
async fn test_raw_fetch_stops_at_limit() {
    let relay = MockRelay::start((1..=5).map(|i| note(&format!("n{i}"), i)).collect()).await;

    let request = FetchRequest::new(runstr_filter())
        .relays(vec![relay.url.clone()])
        .timeout(Duration::from_secs(2))
        .limit(2);
    let report = RawFetcher::default().fetch(&request).await;

    assert_eq!(report.events.len(), 2);
    assert!(eventually(|| relay.closed().len() == 1).await);
}

#[tokio::test]
async fn test_unreachable_and_silent_relays_finish_by_deadline() {
    let silent = MockRelay::silent().await;
    let request = FetchRequest::new(runstr_filter())
        .relays(vec![unreachable_url(), silent.url.clone()])
        .timeout(Duration::from_millis(300));

    let started = Instant::now();
    let report = RawFetcher::default().fetch(&request).await;
    assert!(started.elapsed() < Duration::from_millis(1300));
    assert_eq!(report.relays_attempted, 2);
    assert_eq!(report.relays_responded, 0);
    assert!(matches!(
        report.into_result(),
        Err(CoreError::NetworkUnreachable)
    ));

    // The silent relay still gets its subscription closed
    assert!(eventually(|| silent.closed().len() == 1).await);
}

#[tokio::test]
async fn test_relay_with_nothing_is_not_a_network_failure() {
    let relay = MockRelay::start(vec![]).await;
    let request = FetchRequest::new(runstr_filter())
        .relays(vec![relay.url.clone()])
        .timeout(Duration::from_secs(1));

    let report = RawFetcher::default().fetch(&request).await;
    assert_eq!(report.relays_responded, 1);
    assert!(matches!(report.into_result(), Err(CoreError::NothingFound)));
}

#[tokio::test]
async fn test_pooled_fetch_uses_connected_relay() {
    let relay = MockRelay::start(vec![note("a", 10), note("b", 20)]).await;
    let pool = RelayPool::new();
    pool.add_relay(&relay.url).await.unwrap();
    pool.connect_relay(&relay.url).await.unwrap();

    let request = FetchRequest::new(runstr_filter())
        .relays(vec![relay.url.clone()])
        .timeout(Duration::from_secs(2));
    let report = PooledFetcher::new(pool.clone(), Duration::from_millis(50))
        .fetch(&request)
        .await;

    assert_eq!(report.events.len(), 2);
    assert_eq!(report.path, FetchPath::Pooled);
    assert_eq!(report.relays_responded, 1);
    assert!(eventually(|| relay.closed().len() == 1).await);
    pool.disconnect_all().await;
}

#[tokio::test]
async fn test_pooled_fetch_counts_only_finished_relays() {
    let silent = MockRelay::silent().await;
    let pool = RelayPool::new();
    pool.connect_relay(&silent.url).await.unwrap();

    let request = FetchRequest::new(runstr_filter())
        .relays(vec![silent.url.clone()])
        .timeout(Duration::from_millis(300));
    let report = PooledFetcher::new(pool.clone(), Duration::from_millis(50))
        .fetch(&request)
        .await;

    assert_eq!(report.relays_attempted, 1);
    assert_eq!(report.relays_responded, 0);
    assert!(matches!(
        report.into_result(),
        Err(CoreError::NetworkUnreachable)
    ));
    pool.disconnect_all().await;
}

#[tokio::test]
async fn test_fallback_reaches_raw_path_when_pool_stalls() {
    let silent = MockRelay::silent().await;
    let relay = MockRelay::start(vec![note("a", 10)]).await;

    let pool = RelayPool::new();
    pool.add_relay(&silent.url).await.unwrap();
    pool.connect_relay(&silent.url).await.unwrap();

    let fetcher = FallbackFetcher::with_budget(
        PooledFetcher::new(pool.clone(), Duration::ZERO),
        RawFetcher::new(Duration::from_millis(500)),
        Duration::from_millis(300),
    );
    let request = FetchRequest::new(runstr_filter())
        .relays(vec![silent.url.clone(), relay.url.clone()])
        .timeout(Duration::from_secs(2));

    let started = Instant::now();
    let report = fetcher.fetch(&request).await;
    assert_eq!(report.path, FetchPath::Raw);
    assert_eq!(report.events.len(), 1);
    assert!(started.elapsed() < Duration::from_millis(1500));
    pool.disconnect_all().await;
}

#[tokio::test]
async fn test_fallback_without_relays_is_immediate() {
    let fetcher = FallbackFetcher::new(
        PooledFetcher::new(RelayPool::new(), Duration::from_millis(50)),
        RawFetcher::default(),
    );
    let started = Instant::now();
    let report = fetcher.fetch(&FetchRequest::new(runstr_filter())).await;
    assert!(report.is_empty());
    assert!(started.elapsed() < Duration::from_millis(100));
}
