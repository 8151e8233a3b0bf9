//! Single relay connection management
//!
//! One WebSocket per relay. A background reader task parses inbound frames
//! and broadcasts them to every interested receiver; malformed frames are
//! logged and dropped without closing the socket. There is no caching here;
//! [`crate::RelayPool`] decides when a dropped relay is dialled again.

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Filter, RelayMessage};
use crate::subscription::generate_fetch_subscription_id;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use nostr::Event;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected (initial state, or closed cleanly)
    Disconnected,
    /// Currently connecting
    Connecting,
    /// Connected and ready
    Connected,
    /// Last connection attempt failed
    Failed,
}

/// Relay connection configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Capacity of the inbound message broadcast channel
    pub message_buffer: usize,
    /// Wait after the first failed dial before the pool tries again
    pub reconnect_delay: Duration,
    /// Cap on the doubling redial wait
    pub max_reconnect_delay: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            message_buffer: 1024,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
        }
    }
}

/// How a stored-events fetch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Relay signalled end of stored events
    Eose,
    /// The result-count cap was hit
    LimitReached,
    /// The deadline elapsed first
    TimedOut,
    /// Relay sent CLOSED for the subscription
    ClosedByRelay,
    /// Socket dropped
    Disconnected,
}

/// Events collected by a one-shot fetch, plus why collection stopped.
#[derive(Debug, Clone)]
pub struct StoredEvents {
    pub events: Vec<Event>,
    pub completion: Completion,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Relay connection
pub struct RelayConnection {
    url: Url,
    config: RelayConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    sink: Arc<Mutex<Option<WsSink>>>,
    messages: broadcast::Sender<RelayMessage>,
    recv_task: SyncMutex<Option<JoinHandle<()>>>,
}

impl RelayConnection {
    /// Create a new relay connection (does not connect yet)
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, RelayConfig::default())
    }

    /// Create a new relay connection with custom config
    pub fn with_config(url: &str, config: RelayConfig) -> Result<Self> {
        let url = Url::parse(url.trim())?;

        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (messages, _) = broadcast::channel(config.message_buffer.max(1));

        Ok(Self {
            url,
            config,
            state: Arc::new(state),
            sink: Arc::new(Mutex::new(None)),
            messages,
            recv_task: SyncMutex::new(None),
        })
    }

    /// Connect to the relay using the configured timeout
    pub async fn connect(&self) -> Result<()> {
        self.connect_with_timeout(self.config.connect_timeout).await
    }

    /// Connect to the relay, giving up after `limit`
    pub async fn connect_with_timeout(&self, limit: Duration) -> Result<()> {
        let mut claimed = false;
        self.state.send_if_modified(|state| match *state {
            ConnectionState::Disconnected | ConnectionState::Failed => {
                *state = ConnectionState::Connecting;
                claimed = true;
                true
            }
            _ => false,
        });
        if !claimed {
            return Err(ClientError::AlreadyConnected);
        }

        info!("Connecting to relay: {}", self.url);
        let started = Instant::now();

        let ws_stream = match timeout(limit, connect_async(self.url.as_str())).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                self.state.send_replace(ConnectionState::Failed);
                warn!("Failed to connect to {}: {}", self.url, e);
                return Err(ClientError::WebSocket(e.to_string()));
            }
            Err(_) => {
                self.state.send_replace(ConnectionState::Failed);
                warn!("Connection to {} timed out after {:?}", self.url, limit);
                return Err(ClientError::Timeout(format!(
                    "Connection timeout after {:?}",
                    limit
                )));
            }
        };

        let (sink, stream) = ws_stream.split();
        *self.sink.lock().await = Some(sink);
        self.state.send_replace(ConnectionState::Connected);
        info!("Connected to relay: {} (took {:?})", self.url, started.elapsed());

        let handle = tokio::spawn(read_loop(
            self.url.to_string(),
            stream,
            Arc::clone(&self.sink),
            Arc::clone(&self.state),
            self.messages.clone(),
        ));
        if let Some(previous) = self.recv_task.lock().replace(handle) {
            previous.abort();
        }

        Ok(())
    }

    /// Disconnect from the relay
    pub async fn disconnect(&self) {
        if let Some(handle) = self.recv_task.lock().take() {
            handle.abort();
        }

        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
            info!("Disconnected from relay: {}", self.url);
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receive every parsed frame from this relay
    pub fn subscribe_messages(&self) -> broadcast::Receiver<RelayMessage> {
        self.messages.subscribe()
    }

    /// Get relay URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Send a frame
    pub async fn send(&self, message: &ClientMessage) -> Result<()> {
        let text = message.to_json()?;
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(ClientError::NotConnected)?;

        debug!("Sending to {}: {}", self.url, text);
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))
    }

    /// Send `["REQ", id, filters...]`
    pub async fn subscribe(&self, subscription_id: &str, filters: Vec<Filter>) -> Result<()> {
        self.send(&ClientMessage::Req {
            subscription_id: subscription_id.to_string(),
            filters,
        })
        .await
    }

    /// Send `["CLOSE", id]`
    pub async fn close_subscription(&self, subscription_id: &str) -> Result<()> {
        self.send(&ClientMessage::Close {
            subscription_id: subscription_id.to_string(),
        })
        .await
    }

    /// Send `["EVENT", event]`. Acknowledgement is not awaited.
    pub async fn publish(&self, event: &Event) -> Result<()> {
        self.send(&ClientMessage::Event(event.clone())).await
    }

    /// Subscribe and collect stored events until EOSE, the cap, a disconnect
    /// or `deadline`, whichever comes first. CLOSE is sent before returning
    /// whenever the socket is still open.
    pub async fn fetch_stored(
        &self,
        subscription_id: &str,
        filters: Vec<Filter>,
        limit: Option<usize>,
        deadline: Instant,
    ) -> Result<StoredEvents> {
        let limit = limit.filter(|l| *l > 0);
        let mut messages = self.messages.subscribe();
        let mut state = self.state.subscribe();
        self.subscribe(subscription_id, filters).await?;

        let mut events = Vec::new();
        let mut seen = HashSet::new();

        let completion = loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break Completion::TimedOut,
                changed = state.changed() => {
                    if changed.is_err() || *state.borrow() != ConnectionState::Connected {
                        break Completion::Disconnected;
                    }
                }
                received = messages.recv() => match received {
                    Ok(RelayMessage::Event { subscription_id: sid, event }) if sid == subscription_id => {
                        if seen.insert(event.id.clone()) {
                            events.push(event);
                            if limit.is_some_and(|l| events.len() >= l) {
                                break Completion::LimitReached;
                            }
                        }
                    }
                    Ok(RelayMessage::Eose { subscription_id: sid }) if sid == subscription_id => {
                        break Completion::Eose;
                    }
                    Ok(RelayMessage::Closed { subscription_id: sid, message }) if sid == subscription_id => {
                        warn!("Relay {} closed subscription {}: {}", self.url, sid, message);
                        break Completion::ClosedByRelay;
                    }
                    Ok(RelayMessage::Notice { message }) => {
                        warn!("NOTICE from {} during {}: {}", self.url, subscription_id, message);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Fetch {} on {} skipped {} frames", subscription_id, self.url, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break Completion::Disconnected,
                },
            }
        };

        if completion != Completion::Disconnected
            && self.is_connected()
            && let Err(e) = self.close_subscription(subscription_id).await
        {
            debug!("Failed to close {} on {}: {}", subscription_id, self.url, e);
        }

        debug!(
            "Fetch {} on {} finished with {} events ({:?})",
            subscription_id,
            self.url,
            events.len(),
            completion
        );
        Ok(StoredEvents { events, completion })
    }

    /// Open a throwaway connection, fetch stored events and close it again.
    ///
    /// `within` bounds the whole exchange including the handshake.
    pub async fn fetch_once(
        url: &str,
        filters: Vec<Filter>,
        limit: Option<usize>,
        within: Duration,
    ) -> Result<StoredEvents> {
        let deadline = Instant::now() + within;
        let conn = Self::new(url)?;
        conn.connect_with_timeout(within).await?;

        let subscription_id = generate_fetch_subscription_id();
        let result = conn
            .fetch_stored(&subscription_id, filters, limit, deadline)
            .await;
        conn.disconnect().await;
        result
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.recv_task.lock().take() {
            handle.abort();
        }
    }
}

async fn read_loop(
    url: String,
    mut stream: SplitStream<WsStream>,
    sink: Arc<Mutex<Option<WsSink>>>,
    state: Arc<watch::Sender<ConnectionState>>,
    messages: broadcast::Sender<RelayMessage>,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match RelayMessage::from_json(text.as_str()) {
                Ok(msg) => {
                    // No receivers is fine
                    let _ = messages.send(msg);
                }
                Err(e) => warn!("Dropping malformed frame from {}: {}", url, e),
            },
            Ok(Message::Ping(data)) => {
                if let Some(sink) = sink.lock().await.as_mut() {
                    let _ = sink.send(Message::Pong(data)).await;
                }
            }
            Ok(Message::Close(_)) => {
                info!("Relay {} closed connection", url);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket error from {}: {}", url, e);
                break;
            }
        }
    }

    sink.lock().await.take();
    state.send_replace(ConnectionState::Disconnected);
    debug!("Receive loop ended for {}", url);
}
