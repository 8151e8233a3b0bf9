//! Fetch through the shared relay pool.

use super::{FetchPath, FetchReport, FetchRequest, Fetcher, dedupe_by_id};
use async_trait::async_trait;
use nostr_client::{RelayPool, normalize_relay_urls};
use std::time::Duration;
use tracing::{debug, warn};

/// Batched query over the pool's persistent connections.
///
/// Unknown relays are added first, but only relays already connected take
/// part in the query.
#[derive(Clone)]
pub struct PooledFetcher {
    pool: RelayPool,
    ensure_grace: Duration,
}

impl PooledFetcher {
    pub fn new(pool: RelayPool, ensure_grace: Duration) -> Self {
        Self { pool, ensure_grace }
    }
}

#[async_trait]
impl Fetcher for PooledFetcher {
    async fn fetch(&self, request: &FetchRequest) -> FetchReport {
        let relays = normalize_relay_urls(&request.relays);
        if relays.is_empty() {
            return FetchReport::empty();
        }

        self.pool.ensure_relays(&relays, self.ensure_grace).await;
        let connected = self.pool.connected_relays(&relays).await;
        let mut report = FetchReport {
            relays_attempted: relays.len(),
            path: FetchPath::Pooled,
            ..Default::default()
        };
        if connected.is_empty() {
            debug!("No pooled connection among {} relays", relays.len());
            return report;
        }

        match self
            .pool
            .query_outcome(vec![request.filter.clone()], &connected, request.timeout)
            .await
        {
            Ok(outcome) => {
                let mut events = dedupe_by_id(outcome.events);
                if let Some(limit) = request.limit {
                    events.truncate(limit);
                }
                report.relays_responded = outcome.responded;
                report.events = events;
            }
            Err(e) => warn!("Pooled query failed: {}", e),
        }

        debug!(
            count = report.events.len(),
            relays = connected.len(),
            "Pooled fetch finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_client::Filter;

    #[tokio::test]
    async fn test_no_relays_is_empty() {
        let fetcher = PooledFetcher::new(RelayPool::new(), Duration::from_millis(10));
        let report = fetcher.fetch(&FetchRequest::new(Filter::new())).await;
        assert_eq!(report, FetchReport::empty());
    }

    #[tokio::test]
    async fn test_unreachable_relay_reports_nothing() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let fetcher = PooledFetcher::new(RelayPool::new(), Duration::from_millis(10));
        let report = fetcher
            .fetch(&FetchRequest::new(Filter::new()).relays(vec![url]))
            .await;
        assert!(report.events.is_empty());
        assert_eq!(report.relays_attempted, 1);
        assert_eq!(report.relays_responded, 0);
    }
}
