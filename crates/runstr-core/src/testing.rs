//! In-memory fetcher, publisher and event builders for unit tests.

use crate::error::{CoreError, Result};
use crate::fetch::{FetchPath, FetchReport, FetchRequest, Fetcher};
use crate::publish::Publisher;
use async_trait::async_trait;
use nostr::Event;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Unsigned kind 1 note with a fixed author.
pub fn note(id: &str, created_at: u64) -> Event {
    event(id, "author", 1, created_at, vec![])
}

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

/// Serves a fixed set of events, answering each request with those the
/// filter matches.
pub struct StaticFetcher {
    events: Mutex<Vec<Event>>,
    path: FetchPath,
    delay: Duration,
    unreachable: bool,
    calls: AtomicUsize,
    requests: Mutex<Vec<FetchRequest>>,
}

impl StaticFetcher {
    pub fn new(events: Vec<Event>, path: FetchPath) -> Self {
        Self {
            events: Mutex::new(events),
            path,
            delay: Duration::ZERO,
            unreachable: false,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A fetcher whose relays never answer.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::new(vec![], FetchPath::Raw)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push(&self, event: Event) {
        self.events.lock().push(event);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }

    pub fn last_timeout(&self) -> Option<Duration> {
        self.requests.lock().last().map(|r| r.timeout)
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, request: &FetchRequest) -> FetchReport {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let attempted = request.relays.len();
        if self.unreachable {
            return FetchReport {
                relays_attempted: attempted,
                path: self.path,
                ..Default::default()
            };
        }

        let mut events: Vec<Event> = self
            .events
            .lock()
            .iter()
            .filter(|e| request.filter.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = request.limit {
            events.truncate(limit);
        }
        FetchReport {
            events,
            relays_attempted: attempted,
            relays_responded: attempted,
            path: self.path,
        }
    }
}

/// Records published events, optionally failing every publish.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Event>>,
    fail: bool,
}

impl RecordingPublisher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn published(&self) -> Vec<Event> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, event: &Event, relays: &[String]) -> Result<usize> {
        if self.fail {
            return Err(CoreError::NetworkUnreachable);
        }
        self.published.lock().push(event.clone());
        Ok(relays.len().max(1))
    }
}
