//! Fetch over throwaway per-relay sockets.

use super::{FetchPath, FetchReport, FetchRequest, Fetcher, dedupe_by_id};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use nostr_client::{Completion, RelayConnection, normalize_relay_urls};
use std::time::Duration;
use tracing::{debug, info};

/// Default per-relay budget.
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens one connection per relay in parallel.
///
/// Each connection ends on its own at EOSE, at the record cap or at its
/// deadline; the fetch completes when the slowest one does.
#[derive(Debug, Clone)]
pub struct RawFetcher {
    relay_timeout: Duration,
}

impl RawFetcher {
    pub fn new(relay_timeout: Duration) -> Self {
        Self { relay_timeout }
    }
}

impl Default for RawFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_RELAY_TIMEOUT)
    }
}

#[async_trait]
impl Fetcher for RawFetcher {
    async fn fetch(&self, request: &FetchRequest) -> FetchReport {
        let relays = normalize_relay_urls(&request.relays);
        if relays.is_empty() {
            return FetchReport::empty();
        }

        let within = self.relay_timeout.min(request.timeout);
        let mut pending: FuturesUnordered<_> = relays
            .iter()
            .map(|url| async move {
                let result = RelayConnection::fetch_once(
                    url,
                    vec![request.filter.clone()],
                    request.limit,
                    within,
                )
                .await;
                (url, result)
            })
            .collect();

        let mut collected = Vec::new();
        let mut responded = 0;
        while let Some((url, result)) = pending.next().await {
            match result {
                Ok(stored) => {
                    debug!(
                        relay = %url,
                        count = stored.events.len(),
                        completion = ?stored.completion,
                        "Raw fetch completed"
                    );
                    // A silent relay that just ran out the clock never answered
                    if stored.completion != Completion::TimedOut || !stored.events.is_empty() {
                        responded += 1;
                    }
                    collected.extend(stored.events);
                }
                Err(e) => debug!(relay = %url, "Raw fetch got nothing: {}", e),
            }
        }

        let events = dedupe_by_id(collected);
        info!(
            count = events.len(),
            responded,
            attempted = relays.len(),
            "Raw fetch finished"
        );
        FetchReport {
            events,
            relays_attempted: relays.len(),
            relays_responded: responded,
            path: FetchPath::Raw,
        }
    }
}
