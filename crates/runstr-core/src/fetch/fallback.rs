//! Budgeted primary path with a fallback.

use super::{FetchReport, FetchRequest, Fetcher};
use async_trait::async_trait;
use nostr_client::normalize_relay_urls;
use std::time::Duration;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

/// Default budget for the primary path.
pub const DEFAULT_PRIMARY_BUDGET: Duration = Duration::from_secs(4);

/// Runs `primary` within a fixed budget and, when it times out or comes back
/// empty, hands the remaining time to `secondary`.
pub struct FallbackFetcher<P, S> {
    primary: P,
    secondary: S,
    primary_budget: Duration,
}

impl<P: Fetcher, S: Fetcher> FallbackFetcher<P, S> {
    pub fn new(primary: P, secondary: S) -> Self {
        Self::with_budget(primary, secondary, DEFAULT_PRIMARY_BUDGET)
    }

    pub fn with_budget(primary: P, secondary: S, primary_budget: Duration) -> Self {
        Self {
            primary,
            secondary,
            primary_budget,
        }
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }

    pub fn secondary(&self) -> &S {
        &self.secondary
    }
}

#[async_trait]
impl<P: Fetcher, S: Fetcher> Fetcher for FallbackFetcher<P, S> {
    async fn fetch(&self, request: &FetchRequest) -> FetchReport {
        if request.relays.iter().all(|url| url.trim().is_empty()) {
            debug!("Fetch without relays, nothing to do");
            return FetchReport::empty();
        }

        let started = Instant::now();
        let budget = self.primary_budget.min(request.timeout);
        let primary_request = request.clone().timeout(budget);

        match timeout(budget, self.primary.fetch(&primary_request)).await {
            Ok(report) if !report.is_empty() => {
                debug!(count = report.events.len(), "Primary path answered");
                return report;
            }
            Ok(_) => debug!("Primary path came back empty, falling back"),
            Err(_) => warn!("Primary path timed out after {:?}, falling back", budget),
        }

        let remaining = request.timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            warn!("No time left for the fallback path");
            return FetchReport {
                relays_attempted: normalize_relay_urls(&request.relays).len(),
                ..Default::default()
            };
        }

        let report = self
            .secondary
            .fetch(&request.clone().timeout(remaining))
            .await;
        info!(
            count = report.events.len(),
            responded = report.relays_responded,
            "Fallback path finished"
        );
        report
    }
}
