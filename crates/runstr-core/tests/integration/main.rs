//! Integration tests for the RUNSTR core against in-process relays
//!
//! Each [`MockRelay`] is a real WebSocket server speaking the NIP-01 subset
//! the core uses: it answers REQ from its stored events, sends EOSE (unless
//! silent), records CLOSE, acknowledges EVENT and forwards published events
//! to matching open subscriptions.

pub mod facade;
pub mod fetch;
pub mod groups;
pub mod pool;

use futures::{SinkExt, StreamExt};
use nostr::{Event, sort_events};
use nostr_client::Filter;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Once;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

struct RelayState {
    stored: Mutex<Vec<Event>>,
    requests: Mutex<Vec<(String, Vec<Filter>)>>,
    closed: Mutex<Vec<String>>,
    published: Mutex<Vec<Event>>,
    silent: bool,
    live: broadcast::Sender<Event>,
}

impl RelayState {
    fn matching(&self, filters: &[Filter]) -> Vec<Event> {
        let mut stored = self.stored.lock().clone();
        sort_events(&mut stored);

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for filter in filters {
            let limit = filter.limit.map_or(usize::MAX, |l| l as usize);
            for event in stored.iter().filter(|e| filter.matches(e)).take(limit) {
                if seen.insert(event.id.clone()) {
                    out.push(event.clone());
                }
            }
        }
        out
    }
}

/// A WebSocket relay serving a fixed set of events.
pub struct MockRelay {
    pub url: String,
    state: Arc<RelayState>,
    handle: JoinHandle<()>,
}

impl MockRelay {
    pub async fn start(events: Vec<Event>) -> Self {
        Self::spawn(events, false).await
    }

    /// A relay that accepts subscriptions but never answers them.
    pub async fn silent() -> Self {
        Self::spawn(Vec::new(), true).await
    }

    /// A relay listening at `url`, e.g. one that was down earlier.
    pub async fn start_at(url: &str, events: Vec<Event>) -> Self {
        let addr = url.trim_start_matches("ws://");
        let listener = TcpListener::bind(addr).await.unwrap();
        Self::serve_on(listener, events, false)
    }

    async fn spawn(events: Vec<Event>, silent: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve_on(listener, events, silent)
    }

    fn serve_on(listener: TcpListener, events: Vec<Event>, silent: bool) -> Self {
        init_tracing();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (live, _) = broadcast::channel(64);
        let state = Arc::new(RelayState {
            stored: Mutex::new(events),
            requests: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            silent,
            live,
        });

        let server_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&server_state)));
            }
        });
        Self { url, state, handle }
    }

    pub fn store(&self, event: Event) {
        self.state.stored.lock().push(event);
    }

    /// Subscription ids seen in REQ frames.
    pub fn requests(&self) -> Vec<String> {
        self.state
            .requests
            .lock()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn filters(&self) -> Vec<Filter> {
        self.state
            .requests
            .lock()
            .iter()
            .flat_map(|(_, filters)| filters.clone())
            .collect()
    }

    /// Subscription ids seen in CLOSE frames.
    pub fn closed(&self) -> Vec<String> {
        self.state.closed.lock().clone()
    }

    pub fn published(&self) -> Vec<Event> {
        self.state.published.lock().clone()
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A `ws://` URL nothing listens on.
pub fn unreachable_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);
    url
}

async fn serve(stream: TcpStream, state: Arc<RelayState>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut frames) = ws.split();
    let mut live = state.live.subscribe();
    let mut subscriptions: HashMap<String, Vec<Filter>> = HashMap::new();

    loop {
        let outgoing: Vec<Value> = tokio::select! {
            frame = frames.next() => {
                let Some(Ok(frame)) = frame else { break };
                let Message::Text(text) = frame else { continue };
                let Ok(Value::Array(parts)) = serde_json::from_str::<Value>(text.as_str()) else {
                    continue;
                };
                handle_frame(&state, &mut subscriptions, &parts)
            }
            received = live.recv() => {
                let Ok(event) = received else { continue };
                subscriptions
                    .iter()
                    .filter(|(_, filters)| filters.iter().any(|f| f.matches(&event)))
                    .map(|(id, _)| json!(["EVENT", id, event]))
                    .collect()
            }
        };

        for value in outgoing {
            if sink.send(Message::Text(value.to_string().into())).await.is_err() {
                return;
            }
        }
    }
}

fn handle_frame(
    state: &RelayState,
    subscriptions: &mut HashMap<String, Vec<Filter>>,
    parts: &[Value],
) -> Vec<Value> {
    let kind = parts.first().and_then(Value::as_str);
    let second = parts.get(1).cloned().unwrap_or(Value::Null);
    match kind {
        Some("REQ") => {
            let id = second.as_str().unwrap_or_default().to_string();
            let filters: Vec<Filter> = parts
                .iter()
                .skip(2)
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect();
            state.requests.lock().push((id.clone(), filters.clone()));

            let mut out = Vec::new();
            if !state.silent {
                out.extend(
                    state
                        .matching(&filters)
                        .into_iter()
                        .map(|event| json!(["EVENT", id, event])),
                );
                out.push(json!(["EOSE", id]));
            }
            subscriptions.insert(id, filters);
            out
        }
        Some("CLOSE") => {
            let id = second.as_str().unwrap_or_default().to_string();
            subscriptions.remove(&id);
            state.closed.lock().push(id);
            Vec::new()
        }
        Some("EVENT") => {
            let Ok(event) = serde_json::from_value::<Event>(second) else {
                return vec![json!(["NOTICE", "invalid event"])];
            };
            state.stored.lock().push(event.clone());
            state.published.lock().push(event.clone());
            let _ = state.live.send(event.clone());
            vec![json!(["OK", event.id, true, ""])]
        }
        _ => vec![json!(["NOTICE", "unsupported"])],
    }
}

/// Unsigned test event.
pub fn event(id: &str, pubkey: &str, kind: u16, created_at: u64, tags: Vec<Vec<&str>>) -> Event {
    Event {
        id: id.to_string(),
        pubkey: pubkey.to_string(),
        created_at,
        kind,
        tags: tags
            .into_iter()
            .map(|tag| tag.into_iter().map(str::to_string).collect())
            .collect(),
        content: String::new(),
        sig: String::new(),
    }
}
