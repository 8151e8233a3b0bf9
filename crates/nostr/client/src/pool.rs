//! Relay pool for managing connections to multiple Nostr relays.
//!
//! The pool keeps one persistent connection per relay, batches a query into a
//! single REQ per connected relay, and forwards inbound frames as
//! [`PoolEvent`]s. It never blocks on a relay longer than the caller asked.

use crate::backoff::ExponentialBackoff;
use crate::error::{ClientError, Result};
use crate::message::{Filter, RelayMessage};
use crate::relay::{ConnectionState, RelayConfig, RelayConnection};
use crate::subscription::{SubscriptionTracker, generate_subscription_id};
use nostr::Event;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{RwLock, broadcast};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

/// Events emitted by the relay pool.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A relay connected
    Connected { relay_url: String },
    /// A relay disconnected
    Disconnected { relay_url: String },
    /// An event was received from a relay
    Event {
        relay_url: String,
        subscription_id: String,
        event: Event,
    },
    /// EOSE received for a subscription on a relay
    Eose {
        relay_url: String,
        subscription_id: String,
    },
    /// All relays have sent EOSE for a subscription
    AllEose { subscription_id: String },
    /// OK response for a published event
    Ok {
        relay_url: String,
        event_id: String,
        success: bool,
        message: String,
    },
    /// Notice from a relay
    Notice { relay_url: String, message: String },
    /// Connection error
    Error { relay_url: String, error: String },
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Per-connection settings
    pub relay: RelayConfig,
    /// Capacity of the pool event channel
    pub event_buffer: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            event_buffer: 1000,
        }
    }
}

/// Relays gathered by [`RelayPool::query_outcome`].
#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    /// Events deduplicated by id, in arrival order
    pub events: Vec<Event>,
    /// Relays that sent EOSE (or dropped) before the deadline
    pub responded: usize,
}

/// Redial schedule for a relay whose last dial failed.
#[derive(Debug)]
struct Redial {
    backoff: ExponentialBackoff,
    not_before: Instant,
}

/// The key a relay URL is stored under: trimmed, without trailing slashes.
pub fn normalize_relay_url(url: &str) -> &str {
    url.trim().trim_end_matches('/')
}

/// Trim whitespace and trailing slashes, drop blanks and deduplicate relay
/// URLs, keeping first occurrence order.
pub fn normalize_relay_urls<S: AsRef<str>>(urls: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.iter()
        .map(|u| normalize_relay_url(u.as_ref()))
        .filter(|u| !u.is_empty())
        .filter(|u| seen.insert(u.to_string()))
        .map(str::to_string)
        .collect()
}

/// A pool of Nostr relay connections.
///
/// Cloning is cheap and every clone shares the same connections.
#[derive(Clone)]
pub struct RelayPool {
    /// Connections indexed by URL
    connections: Arc<RwLock<HashMap<String, Arc<RelayConnection>>>>,
    /// Subscription trackers indexed by subscription ID
    subscriptions: Arc<RwLock<HashMap<String, SubscriptionTracker>>>,
    /// Broadcast channel for pool events
    events_tx: broadcast::Sender<PoolEvent>,
    /// Relays waiting out a failed dial
    redials: Arc<Mutex<HashMap<String, Redial>>>,
    config: PoolConfig,
    default_relays: Vec<String>,
}

impl RelayPool {
    /// Create a new relay pool.
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    /// Create a new relay pool with custom config.
    pub fn with_config(config: PoolConfig) -> Self {
        let (events_tx, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            events_tx,
            redials: Arc::new(Mutex::new(HashMap::new())),
            config,
            default_relays: Vec::new(),
        }
    }

    /// Create a new relay pool with default relays.
    pub fn with_relays(relays: Vec<String>) -> Self {
        let mut pool = Self::new();
        pool.default_relays = normalize_relay_urls(&relays);
        pool
    }

    /// Relays used by [`RelayPool::connect_default`].
    pub fn default_relays(&self) -> &[String] {
        &self.default_relays
    }

    /// Subscribe to pool events.
    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.events_tx.subscribe()
    }

    /// Get all relay URLs in the pool.
    pub async fn relay_urls(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    /// Get connection states for all relays.
    pub async fn states(&self) -> HashMap<String, ConnectionState> {
        self.connections
            .read()
            .await
            .iter()
            .map(|(url, conn)| (url.clone(), conn.state()))
            .collect()
    }

    /// Check if a relay is connected.
    pub async fn is_connected(&self, url: &str) -> bool {
        self.connections
            .read()
            .await
            .get(normalize_relay_url(url))
            .is_some_and(|conn| conn.is_connected())
    }

    /// Get the number of connected relays.
    pub async fn connected_count(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|conn| conn.is_connected())
            .count()
    }

    async fn connection(&self, url: &str) -> Option<Arc<RelayConnection>> {
        self.connections.read().await.get(url).cloned()
    }

    /// Add a relay to the pool without connecting.
    ///
    /// Returns `false` when the relay was already known.
    pub async fn add_relay(&self, url: &str) -> Result<bool> {
        let url = normalize_relay_url(url);
        if self.connections.read().await.contains_key(url) {
            return Ok(false);
        }

        let conn = Arc::new(RelayConnection::with_config(url, self.config.relay.clone())?);
        let mut conns = self.connections.write().await;
        if conns.contains_key(url) {
            return Ok(false);
        }
        info!("Adding relay to pool: {}", url);
        conns.insert(url.to_string(), conn);
        Ok(true)
    }

    /// Remove a relay from the pool.
    pub async fn remove_relay(&self, url: &str) {
        let url = normalize_relay_url(url);
        let conn = self.connections.write().await.remove(url);
        self.redials.lock().remove(url);
        if let Some(conn) = conn {
            info!("Removing relay from pool: {}", url);
            conn.disconnect().await;
        }

        let mut subs = self.subscriptions.write().await;
        for tracker in subs.values_mut() {
            tracker.remove_relay(url);
        }
    }

    /// Connect to a specific relay, adding it first if unknown.
    pub async fn connect_relay(&self, url: &str) -> Result<()> {
        let url = normalize_relay_url(url);
        self.add_relay(url).await?;
        let conn = self
            .connection(url)
            .await
            .ok_or_else(|| ClientError::InvalidUrl(url.to_string()))?;
        if conn.is_connected() {
            return Ok(());
        }

        match conn.connect().await {
            Ok(()) => {
                self.redials.lock().remove(url);
            }
            // Another task is dialling
            Err(ClientError::AlreadyConnected) => return Err(ClientError::AlreadyConnected),
            Err(e) => {
                self.schedule_redial(url);
                let _ = self.events_tx.send(PoolEvent::Error {
                    relay_url: url.to_string(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        }

        self.spawn_message_forwarder(&conn, url.to_string());

        // Resubscribe to active subscriptions on this relay
        let active: Vec<(String, Vec<Filter>)> = self
            .subscriptions
            .read()
            .await
            .values()
            .filter(|tracker| tracker.has_relay(url))
            .map(|tracker| (tracker.id.clone(), tracker.filters.clone()))
            .collect();
        for (id, filters) in active {
            if let Err(e) = conn.subscribe(&id, filters).await {
                warn!("Failed to resubscribe {} on {}: {}", id, url, e);
            }
        }

        let _ = self.events_tx.send(PoolEvent::Connected {
            relay_url: url.to_string(),
        });
        Ok(())
    }

    /// Spawn a task to forward relay messages to pool events.
    fn spawn_message_forwarder(&self, conn: &RelayConnection, relay_url: String) {
        let mut rx = conn.subscribe_messages();
        let mut state = conn.watch_state();
        let events_tx = self.events_tx.clone();
        let subscriptions = Arc::clone(&self.subscriptions);

        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    biased;
                    received = rx.recv() => match received {
                        Ok(msg) => msg,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Forwarder for {} skipped {} frames", relay_url, skipped);
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                    changed = state.changed() => {
                        if changed.is_err() || *state.borrow() != ConnectionState::Connected {
                            break;
                        }
                        continue;
                    }
                };

                let pool_event = match msg {
                    RelayMessage::Event {
                        subscription_id,
                        event,
                    } => PoolEvent::Event {
                        relay_url: relay_url.clone(),
                        subscription_id,
                        event,
                    },
                    RelayMessage::Eose { subscription_id } => {
                        let all_eose = {
                            let mut subs = subscriptions.write().await;
                            match subs.get_mut(&subscription_id) {
                                Some(tracker) => {
                                    tracker.mark_eose(&relay_url);
                                    tracker.all_eose
                                }
                                None => false,
                            }
                        };

                        let _ = events_tx.send(PoolEvent::Eose {
                            relay_url: relay_url.clone(),
                            subscription_id: subscription_id.clone(),
                        });

                        if all_eose {
                            PoolEvent::AllEose { subscription_id }
                        } else {
                            continue;
                        }
                    }
                    RelayMessage::Ok {
                        event_id,
                        success,
                        message,
                    } => PoolEvent::Ok {
                        relay_url: relay_url.clone(),
                        event_id,
                        success,
                        message,
                    },
                    RelayMessage::Notice { message } => PoolEvent::Notice {
                        relay_url: relay_url.clone(),
                        message,
                    },
                    RelayMessage::Closed {
                        subscription_id,
                        message,
                    } => {
                        warn!(
                            "Subscription {} closed by {}: {}",
                            subscription_id, relay_url, message
                        );
                        continue;
                    }
                    RelayMessage::Auth { .. } => {
                        debug!("Ignoring AUTH challenge from {}", relay_url);
                        continue;
                    }
                };

                let _ = events_tx.send(pool_event);
            }

            // A dropped relay counts as done for every subscription waiting on it
            let finished: Vec<String> = {
                let mut subs = subscriptions.write().await;
                subs.values_mut()
                    .filter(|tracker| tracker.has_relay(&relay_url) && !tracker.all_eose)
                    .filter_map(|tracker| {
                        tracker.mark_eose(&relay_url);
                        tracker.all_eose.then(|| tracker.id.clone())
                    })
                    .collect()
            };
            for subscription_id in finished {
                let _ = events_tx.send(PoolEvent::AllEose { subscription_id });
            }

            info!("Relay {} left the pool's connected set", relay_url);
            let _ = events_tx.send(PoolEvent::Disconnected { relay_url });
        });
    }

    /// Push back the next dial of `url` along its backoff.
    fn schedule_redial(&self, url: &str) {
        let relay = &self.config.relay;
        let mut redials = self.redials.lock();
        let redial = redials.entry(url.to_string()).or_insert_with(|| Redial {
            backoff: ExponentialBackoff::new(relay.reconnect_delay, relay.max_reconnect_delay, 0),
            not_before: Instant::now(),
        });
        let delay = redial
            .backoff
            .next_delay()
            .unwrap_or(relay.max_reconnect_delay);
        redial.not_before = Instant::now() + delay;
        debug!(
            "Next dial of {} in {:?} (failure {})",
            url,
            delay,
            redial.backoff.attempt()
        );
    }

    /// A known relay that is down and past its redial wait.
    async fn needs_redial(&self, url: &str) -> bool {
        let Some(conn) = self.connection(url).await else {
            return false;
        };
        if !matches!(
            conn.state(),
            ConnectionState::Failed | ConnectionState::Disconnected
        ) {
            return false;
        }
        self.redials
            .lock()
            .get(url)
            .is_none_or(|redial| Instant::now() >= redial.not_before)
    }

    /// Make sure the pool knows about `urls` and is connecting to them.
    ///
    /// Connected relays and open subscriptions are left untouched. New relays,
    /// and known relays that are down and past their redial wait, are dialled
    /// in the background; the caller waits at most `grace` for them.
    pub async fn ensure_relays<S: AsRef<str>>(&self, urls: &[S], grace: Duration) {
        let mut pending = Vec::new();
        for url in normalize_relay_urls(urls) {
            let dial = match self.add_relay(&url).await {
                Ok(true) => true,
                Ok(false) => {
                    let redial = self.needs_redial(&url).await;
                    if redial {
                        info!("Redialling relay {}", url);
                    }
                    redial
                }
                Err(e) => {
                    warn!("Ignoring relay {}: {}", url, e);
                    false
                }
            };
            if dial {
                let pool = self.clone();
                pending.push(tokio::spawn(async move {
                    if let Err(e) = pool.connect_relay(&url).await {
                        warn!("Could not connect to {}: {}", url, e);
                    }
                }));
            }
        }

        if pending.is_empty() {
            return;
        }
        debug!("Waiting up to {:?} for {} relays", grace, pending.len());
        let _ = timeout(grace, futures::future::join_all(pending)).await;
    }

    /// Wait until at least `min_relays` are connected.
    ///
    /// Returns `false` on timeout instead of failing.
    pub async fn wait_for_connected(&self, min_relays: usize, within: Duration) -> bool {
        let mut rx = self.events_tx.subscribe();
        let current = self.connected_count().await;
        if current >= min_relays {
            debug!("Already connected to {} >= {} relays", current, min_relays);
            return true;
        }

        info!(
            "Waiting for {} relays to connect (current: {}, max {:?})",
            min_relays, current, within
        );
        let reached = timeout(within, async {
            loop {
                match rx.recv().await {
                    Ok(PoolEvent::Connected { .. }) | Err(RecvError::Lagged(_)) => {
                        if self.connected_count().await >= min_relays {
                            return true;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Closed) => return false,
                }
            }
        })
        .await;

        match reached {
            Ok(true) => true,
            _ => {
                warn!(
                    "Timed out waiting for {} relays; connected: {}",
                    min_relays,
                    self.connected_count().await
                );
                false
            }
        }
    }

    /// Connect to all relays in the pool.
    pub async fn connect_all(&self) -> Vec<(String, Result<()>)> {
        let urls = self.relay_urls().await;
        let mut results = Vec::new();
        for url in urls {
            let result = self.connect_relay(&url).await;
            results.push((url, result));
        }
        results
    }

    /// Connect to default relays.
    pub async fn connect_default(&self) -> Vec<(String, Result<()>)> {
        for url in &self.default_relays {
            if let Err(e) = self.add_relay(url).await {
                warn!("Skipping default relay {}: {}", url, e);
            }
        }
        self.connect_all().await
    }

    /// Disconnect from all relays.
    pub async fn disconnect_all(&self) {
        let conns: Vec<_> = self.connections.read().await.values().cloned().collect();
        for conn in conns {
            conn.disconnect().await;
        }
    }

    /// Connected relays among `relays`, or every connected relay when empty.
    async fn connected_targets(&self, relays: &[String]) -> Vec<(String, Arc<RelayConnection>)> {
        let conns = self.connections.read().await;
        if relays.is_empty() {
            return conns
                .iter()
                .filter(|(_, conn)| conn.is_connected())
                .map(|(url, conn)| (url.clone(), Arc::clone(conn)))
                .collect();
        }
        normalize_relay_urls(relays)
            .into_iter()
            .filter_map(|url| {
                conns
                    .get(&url)
                    .filter(|conn| conn.is_connected())
                    .map(|conn| (url, Arc::clone(conn)))
            })
            .collect()
    }

    /// URLs among `relays` (or the whole pool when empty) that are connected right now.
    pub async fn connected_relays(&self, relays: &[String]) -> Vec<String> {
        self.connected_targets(relays)
            .await
            .into_iter()
            .map(|(url, _)| url)
            .collect()
    }

    /// Register a tracker and send REQ to every target. Returns how many
    /// relays accepted the request.
    async fn open_subscription(
        &self,
        subscription_id: &str,
        filters: Vec<Filter>,
        targets: &[(String, Arc<RelayConnection>)],
    ) -> usize {
        let mut tracker = SubscriptionTracker::new(subscription_id, filters.clone());
        for (url, _) in targets {
            tracker.add_relay(url.clone());
        }
        self.subscriptions
            .write()
            .await
            .insert(subscription_id.to_string(), tracker);

        let mut opened = 0;
        for (url, conn) in targets {
            match conn.subscribe(subscription_id, filters.clone()).await {
                Ok(()) => opened += 1,
                Err(e) => {
                    warn!("Failed to subscribe {} on {}: {}", subscription_id, url, e);
                    if let Some(tracker) = self.subscriptions.write().await.get_mut(subscription_id) {
                        tracker.remove_relay(url);
                    }
                }
            }
        }

        let done = self
            .subscriptions
            .read()
            .await
            .get(subscription_id)
            .is_some_and(|tracker| tracker.all_eose);
        if opened > 0 && done {
            let _ = self.events_tx.send(PoolEvent::AllEose {
                subscription_id: subscription_id.to_string(),
            });
        }
        opened
    }

    /// Subscribe on `relays` (every connected relay when empty).
    pub async fn subscribe(&self, filters: Vec<Filter>, relays: &[String]) -> Result<String> {
        let subscription_id = generate_subscription_id();
        self.subscribe_with_id(&subscription_id, filters, relays).await?;
        Ok(subscription_id)
    }

    /// Subscribe with a specific subscription ID.
    pub async fn subscribe_with_id(
        &self,
        subscription_id: &str,
        filters: Vec<Filter>,
        relays: &[String],
    ) -> Result<usize> {
        let targets = self.connected_targets(relays).await;
        info!(
            "Creating subscription {} with {} filters on {} relays",
            subscription_id,
            filters.len(),
            targets.len()
        );

        let opened = self.open_subscription(subscription_id, filters, &targets).await;
        if opened == 0 {
            self.subscriptions.write().await.remove(subscription_id);
            return Err(ClientError::NoConnectedRelays(relays.join(", ")));
        }
        Ok(opened)
    }

    /// Close a subscription on every relay that has it.
    pub async fn unsubscribe(&self, subscription_id: &str) {
        let tracker = self.subscriptions.write().await.remove(subscription_id);
        let Some(tracker) = tracker else {
            return;
        };
        debug!("Closing subscription {}", subscription_id);

        for url in &tracker.relays {
            if let Some(conn) = self.connection(url).await
                && conn.is_connected()
                && let Err(e) = conn.close_subscription(subscription_id).await
            {
                warn!("Failed to unsubscribe {} on {}: {}", subscription_id, url, e);
            }
        }
    }

    /// One-shot query batched across connected relays.
    ///
    /// Finishes when every relay has sent EOSE (or dropped) or when `within`
    /// elapses, returning whatever arrived. Events are deduplicated by id.
    pub async fn query(
        &self,
        filters: Vec<Filter>,
        relays: &[String],
        within: Duration,
    ) -> Result<Vec<Event>> {
        self.query_outcome(filters, relays, within)
            .await
            .map(|outcome| outcome.events)
    }

    /// [`RelayPool::query`], also reporting how many relays finished.
    pub async fn query_outcome(
        &self,
        filters: Vec<Filter>,
        relays: &[String],
        within: Duration,
    ) -> Result<QueryOutcome> {
        let targets = self.connected_targets(relays).await;
        if targets.is_empty() {
            return Err(ClientError::NoConnectedRelays(relays.join(", ")));
        }

        let subscription_id = generate_subscription_id();
        let mut rx = self.events_tx.subscribe();
        if self.open_subscription(&subscription_id, filters, &targets).await == 0 {
            self.subscriptions.write().await.remove(&subscription_id);
            return Err(ClientError::NoConnectedRelays(relays.join(", ")));
        }

        let mut events = Vec::new();
        let mut seen = HashSet::new();
        let collect = async {
            loop {
                match rx.recv().await {
                    Ok(PoolEvent::Event {
                        subscription_id: sid,
                        event,
                        ..
                    }) if sid == subscription_id => {
                        if seen.insert(event.id.clone()) {
                            events.push(event);
                        }
                    }
                    Ok(PoolEvent::AllEose {
                        subscription_id: sid,
                    }) if sid == subscription_id => break,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Query {} skipped {} pool events", subscription_id, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };
        if timeout(within, collect).await.is_err() {
            debug!("Query {} timed out after {:?}", subscription_id, within);
        }

        let responded = self
            .subscriptions
            .read()
            .await
            .get(&subscription_id)
            .map_or(0, |tracker| tracker.eose_relays.len());
        self.unsubscribe(&subscription_id).await;
        debug!(
            "Query {} returned {} events from {} relays",
            subscription_id,
            events.len(),
            responded
        );
        Ok(QueryOutcome { events, responded })
    }

    /// Publish an event to `relays` (every connected relay when empty).
    ///
    /// Returns how many relays the frame was written to.
    pub async fn publish(&self, event: &Event, relays: &[String]) -> Result<usize> {
        let targets = self.connected_targets(relays).await;
        let mut sent = 0;
        for (url, conn) in &targets {
            match conn.publish(event).await {
                Ok(()) => sent += 1,
                Err(e) => warn!("Failed to publish {} to {}: {}", event.id, url, e),
            }
        }

        if sent == 0 {
            return Err(ClientError::PublishFailed(format!(
                "no connected relay accepted event {}",
                event.id
            )));
        }
        info!("Published {} (kind {}) to {} relays", event.id, event.kind, sent);
        Ok(sent)
    }
}

impl Default for RelayPool {
    fn default() -> Self {
        Self::new()
    }
}
