//! The assembled core: fetch defaults, feed loading and live updates

use super::fetch::eventually;
use super::*;
use nostr::unix_now;
use runstr_core::{CoreConfig, FetchPath, OperationClass, RunstrCore};
use std::time::Duration;

fn core_for(relays: &[&MockRelay]) -> RunstrCore {
    let mut config = CoreConfig::default();
    config.relays.urls = relays.iter().map(|r| r.url.clone()).collect();
    config.fetch.pooled_budget_ms = 1_000;
    config.fetch.overall_timeout_ms = 2_000;
    config.fetch.raw_relay_timeout_ms = 1_000;
    RunstrCore::new(config, None)
}

fn runstr_note(id: &str, pubkey: &str, created_at: u64) -> Event {
    event(id, pubkey, 1, created_at, vec![vec!["t", "runstr"]])
}

#[tokio::test]
async fn test_fetch_uses_configured_relays() {
    let relay_a = MockRelay::start(vec![runstr_note("a", "alice", 10)]).await;
    let relay_b = MockRelay::start(vec![runstr_note("a", "alice", 10), runstr_note("b", "bob", 20)]).await;
    let core = core_for(&[&relay_a, &relay_b]);

    let report = core
        .fetch(Filter::new().kinds(vec![1]), None, None, None)
        .await;
    let mut ids: Vec<&str> = report.events.iter().map(|e| e.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["a", "b"]);
    assert_ne!(report.path, FetchPath::None);
    core.shutdown().await;
}

#[tokio::test]
async fn test_connect_and_wait() {
    let relay = MockRelay::start(vec![]).await;
    let core = core_for(&[&relay]);
    core.connect().await;
    assert!(core.wait_for_connected().await);
    assert_eq!(core.pool().connected_count().await, 1);
    core.shutdown().await;
}

#[tokio::test]
async fn test_load_feed_with_secondary_data() {
    let now = unix_now();
    let mut profile = event("p1", "alice", 0, now - 50, vec![]);
    profile.content = r#"{"name":"alice","display_name":"Alice"}"#.to_string();
    let relay = MockRelay::start(vec![
        runstr_note("n1", "alice", now - 60),
        runstr_note("n2", "bob", now - 30),
        runstr_note("stale", "bob", now - 30 * 24 * 3600),
        profile,
        event("l1", "bob", 7, now - 20, vec![vec!["e", "n1"]]),
        event("r1", "carol", 6, now - 10, vec![vec!["e", "n1"]]),
    ])
    .await;
    let core = core_for(&[&relay]);

    let entries = core.load_feed(false).await.unwrap();
    let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["n2", "n1"]);

    let n1 = &entries[1];
    assert_eq!(n1.author.label(), "Alice");
    assert_eq!((n1.likes, n1.reposts, n1.comments), (1, 1, 0));
    assert!(core.cache().is_valid());
    assert_eq!(core.cache().progress(), 100);

    // Fresh cache is served without another REQ
    let requests = relay.requests().len();
    core.load_feed(false).await.unwrap();
    assert_eq!(relay.requests().len(), requests);
    core.shutdown().await;
}

#[tokio::test]
async fn test_feed_load_waits_for_auth() {
    let relay = MockRelay::start(vec![runstr_note("n1", "alice", unix_now() - 5)]).await;
    let core = Arc::new(core_for(&[&relay]));
    assert!(core.start(OperationClass::Auth));

    let loading = {
        let core = Arc::clone(&core);
        tokio::spawn(async move { core.load_feed(true).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(relay.requests().is_empty());

    core.end(OperationClass::Auth);
    let entries = loading.await.unwrap().unwrap();
    assert_eq!(entries.len(), 1);
    core.shutdown().await;
}

#[tokio::test]
async fn test_core_subscribe_receives_records() {
    let relay = MockRelay::start(vec![runstr_note("n1", "alice", 100)]).await;
    let core = core_for(&[&relay]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = core
        .subscribe(
            Filter::new().kinds(vec![1]),
            None,
            move |event| sink.lock().push(event.id),
            Some(50),
        )
        .await;
    assert!(eventually(|| seen.lock().as_slice() == ["n1".to_string()]).await);

    let since_filter = relay.filters().pop().unwrap();
    assert_eq!(since_filter.since, Some(50));
    subscription.unsubscribe().await;
    core.shutdown().await;
}
