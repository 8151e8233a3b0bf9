//! Dual-path fetch engine.
//!
//! A [`Fetcher`] turns one filter plus relay hints into records. Relay
//! trouble never surfaces as an error here: a relay that fails or stalls just
//! contributes nothing, and the [`FetchReport`] says how many answered.
//!
//! - [`PooledFetcher`]: batched query through the shared [`RelayPool`](nostr_client::RelayPool)
//! - [`RawFetcher`]: one throwaway socket per relay, all in parallel
//! - [`FallbackFetcher`]: tries one fetcher within a budget, then the other

mod fallback;
mod pooled;
mod raw;

pub use fallback::FallbackFetcher;
pub use pooled::PooledFetcher;
pub use raw::RawFetcher;

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use nostr::Event;
use nostr_client::Filter;
use std::collections::HashSet;
use std::time::Duration;

/// Default end-to-end budget for a fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(8);

/// One logical query.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub filter: Filter,
    /// Relay URLs to ask. An empty list means there is nobody to ask.
    pub relays: Vec<String>,
    pub timeout: Duration,
    /// Stop reading from a relay after this many records
    pub limit: Option<usize>,
}

impl FetchRequest {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            relays: Vec::new(),
            timeout: DEFAULT_FETCH_TIMEOUT,
            limit: None,
        }
    }

    pub fn relays(mut self, relays: Vec<String>) -> Self {
        self.relays = relays;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Which path produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchPath {
    #[default]
    None,
    Pooled,
    Raw,
}

/// Records from a fetch plus how the relays behaved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchReport {
    /// Deduplicated, unordered records
    pub events: Vec<Event>,
    pub relays_attempted: usize,
    /// Relays that completed a subscription, even with zero records
    pub relays_responded: usize,
    pub path: FetchPath,
}

impl FetchReport {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Records, or the total failure that left none.
    pub fn into_result(self) -> Result<Vec<Event>> {
        if !self.events.is_empty() {
            return Ok(self.events);
        }
        if self.relays_attempted == 0 {
            Err(CoreError::NoRelays)
        } else if self.relays_responded == 0 {
            Err(CoreError::NetworkUnreachable)
        } else {
            Err(CoreError::NothingFound)
        }
    }
}

/// A strategy for running a [`FetchRequest`].
///
/// Implementations must return by `request.timeout`, keeping whatever
/// partial results they have at that point.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> FetchReport;
}

#[async_trait]
impl<F: Fetcher + ?Sized> Fetcher for std::sync::Arc<F> {
    async fn fetch(&self, request: &FetchRequest) -> FetchReport {
        (**self).fetch(request).await
    }
}

/// Drop repeated records, keeping the first copy of each id.
pub fn dedupe_by_id(events: impl IntoIterator<Item = Event>) -> Vec<Event> {
    let mut seen = HashSet::new();
    events
        .into_iter()
        .filter(|event| seen.insert(event.id.clone()))
        .collect()
}
