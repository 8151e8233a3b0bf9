//! Membership and group chat over a relay

use super::fetch::eventually;
use super::*;
use nostr::{KIND_GROUP_ADD_USER, KIND_GROUP_CHAT_MESSAGE, KIND_GROUP_REMOVE_USER, Keys};
use runstr_core::{CoreConfig, CoreError, NoRecordPolicy, RunstrCore, Signer};

const GROUP: &str = "sunrise-runners";

fn config_for(relays: &[&MockRelay]) -> CoreConfig {
    let mut config = CoreConfig::default();
    config.relays.urls = relays.iter().map(|r| r.url.clone()).collect();
    config.relays.wait_timeout_ms = 2_000;
    config.fetch.pooled_budget_ms = 1_000;
    config.fetch.overall_timeout_ms = 2_000;
    config.fetch.raw_relay_timeout_ms = 1_000;
    config
}

fn membership(id: &str, kind: u16, actor: &str, ts: u64) -> Event {
    event(id, "admin", kind, ts, vec![vec!["h", GROUP], vec!["p", actor]])
}

#[tokio::test]
async fn test_membership_follows_latest_record() {
    let relay = MockRelay::start(vec![
        membership("add", KIND_GROUP_ADD_USER, "alice", 100),
        membership("rm", KIND_GROUP_REMOVE_USER, "alice", 200),
        membership("add-bob", KIND_GROUP_ADD_USER, "bob", 200),
        membership("rm-bob", KIND_GROUP_REMOVE_USER, "bob", 100),
    ])
    .await;
    let core = RunstrCore::new(config_for(&[&relay]), None);

    assert!(!core.is_member(GROUP, "alice").await);
    assert!(core.is_member(GROUP, "bob").await);
    core.shutdown().await;
}

#[tokio::test]
async fn test_no_record_policy_over_relay() {
    let relay = MockRelay::start(vec![]).await;
    let mut config = config_for(&[&relay]);
    assert!(RunstrCore::new(config.clone(), None).is_member(GROUP, "carol").await);

    config.membership.no_record_policy = NoRecordPolicy::AssumeNotMember;
    let core = RunstrCore::new(config, None);
    assert!(!core.is_member(GROUP, "carol").await);
    core.shutdown().await;
}

#[tokio::test]
async fn test_join_publishes_once() {
    let relay = MockRelay::start(vec![]).await;
    let mut config = config_for(&[&relay]);
    config.membership.no_record_policy = NoRecordPolicy::AssumeNotMember;
    let keys = Keys::generate();
    let core = RunstrCore::new(config, Some(Arc::new(keys.clone()) as Arc<dyn Signer>));

    let joined = core.join(GROUP).await.unwrap().unwrap();
    assert_eq!(joined.kind, KIND_GROUP_ADD_USER);
    assert!(joined.has_tag("p", keys.public_key()));
    assert!(eventually(|| relay.published().len() == 1).await);

    assert!(core.join(GROUP).await.unwrap().is_none());
    assert_eq!(relay.published().len(), 1);
    assert!(core.is_member(GROUP, keys.public_key()).await);

    let left = core.leave(GROUP, keys.public_key()).await.unwrap().unwrap();
    assert_eq!(left.kind, KIND_GROUP_REMOVE_USER);
    assert!(eventually(|| relay.published().len() == 2).await);
    assert!(!core.is_member(GROUP, keys.public_key()).await);
    core.shutdown().await;
}

#[tokio::test]
async fn test_join_after_relay_recovers() {
    let url = unreachable_url();
    let mut config = CoreConfig::default();
    config.relays.urls = vec![url.clone()];
    config.relays.wait_timeout_ms = 2_000;
    config.fetch.pooled_budget_ms = 500;
    config.fetch.overall_timeout_ms = 1_000;
    config.fetch.raw_relay_timeout_ms = 500;
    config.membership.no_record_policy = NoRecordPolicy::AssumeNotMember;
    let core = RunstrCore::new(config, Some(Arc::new(Keys::generate()) as Arc<dyn Signer>));

    core.connect().await;
    assert_eq!(core.pool().connected_count().await, 0);

    let relay = MockRelay::start_at(&url, vec![]).await;
    // Past the first redial wait
    tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;

    let joined = core.join(GROUP).await.unwrap().unwrap();
    assert!(eventually(|| relay.published().iter().any(|e| e.id == joined.id)).await);
    assert!(core.pool().is_connected(&url).await);
    core.shutdown().await;
}

#[tokio::test]
async fn test_leave_for_someone_else_is_denied() {
    let relay = MockRelay::start(vec![membership("add", KIND_GROUP_ADD_USER, "alice", 100)]).await;
    let core = RunstrCore::new(
        config_for(&[&relay]),
        Some(Arc::new(Keys::generate()) as Arc<dyn Signer>),
    );

    let err = core.leave(GROUP, "alice").await.unwrap_err();
    assert!(matches!(err, CoreError::PermissionDenied(_)));
    assert!(relay.published().is_empty());
    core.shutdown().await;
}

#[tokio::test]
async fn test_join_without_signer_fails_fast() {
    let core = RunstrCore::new(config_for(&[]), None);
    assert!(matches!(core.join(GROUP).await, Err(CoreError::NoSigner)));
}

#[tokio::test]
async fn test_group_chat_round_trip() {
    let relay = MockRelay::start(vec![
        event("m1", "alice", KIND_GROUP_CHAT_MESSAGE, 100, vec![vec!["h", GROUP]]),
        event("m2", "bob", KIND_GROUP_CHAT_MESSAGE, 200, vec![vec!["h", GROUP]]),
    ])
    .await;
    let core = RunstrCore::new(
        config_for(&[&relay]),
        Some(Arc::new(Keys::generate()) as Arc<dyn Signer>),
    );

    let history = core.groups().fetch_messages(GROUP, None).await.unwrap();
    let ids: Vec<&str> = history.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2"]);

    let live = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&live);
    let subscription = core
        .groups()
        .subscribe_messages(GROUP, Some(150), move |event| sink.lock().push(event.id))
        .await;
    assert!(eventually(|| live.lock().len() == 1).await);

    let sent = core
        .groups()
        .send_message(GROUP, "Hill repeats at 6?")
        .await
        .unwrap();
    assert!(eventually(|| live.lock().contains(&sent.id)).await);

    subscription.unsubscribe().await;
    core.shutdown().await;
}
