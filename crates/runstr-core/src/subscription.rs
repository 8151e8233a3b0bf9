//! Live subscriptions over the shared pool.

use nostr::Event;
use nostr_client::{Filter, PoolEvent, RelayPool};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Handle to a live subscription. Dropping it stops delivery.
pub struct Subscription {
    id: Option<String>,
    pool: Option<RelayPool>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// A subscription that never delivers anything.
    pub fn noop() -> Self {
        Self {
            id: None,
            pool: None,
            task: None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Whether records can still arrive.
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop delivery and close the subscription on every relay.
    pub async fn unsubscribe(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let (Some(pool), Some(id)) = (self.pool.take(), self.id.take()) {
            pool.unsubscribe(&id).await;
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let (Some(pool), Some(id)) = (self.pool.take(), self.id.take())
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            handle.spawn(async move { pool.unsubscribe(&id).await });
        }
    }
}

/// Subscribe to `filter` on `relays`, calling `on_record` once per new record.
///
/// Relays are ensured first. When no relay can take the subscription the
/// result is a no-op [`Subscription`] rather than an error.
pub async fn subscribe<F>(
    pool: &RelayPool,
    relays: &[String],
    filter: Filter,
    since: Option<u64>,
    on_record: F,
    grace: Duration,
) -> Subscription
where
    F: Fn(Event) + Send + Sync + 'static,
{
    let filter = match since {
        Some(since) => filter.since(since),
        None => filter,
    };
    pool.ensure_relays(relays, grace).await;

    // Receiver must exist before REQ goes out or early records are lost
    let mut rx = pool.events();
    let id = match pool.subscribe(vec![filter.clone()], relays).await {
        Ok(id) => id,
        Err(e) => {
            warn!("Live subscription unavailable, using no-op: {}", e);
            return Subscription::noop();
        }
    };
    debug!(subscription_id = %id, "Live subscription opened");

    let sid = id.clone();
    let task = tokio::spawn(async move {
        let mut seen = HashSet::new();
        loop {
            match rx.recv().await {
                Ok(PoolEvent::Event {
                    subscription_id,
                    event,
                    relay_url,
                }) if subscription_id == sid => {
                    if !filter.matches(&event) {
                        trace!(relay = %relay_url, "Dropping record outside the filter");
                        continue;
                    }
                    if seen.insert(event.id.clone()) {
                        on_record(event);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(subscription_id = %sid, skipped, "Live subscription lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    Subscription {
        id: Some(id),
        pool: Some(pool.clone()),
        task: Some(task),
    }
}
