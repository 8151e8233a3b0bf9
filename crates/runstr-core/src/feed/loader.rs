//! Feed loading and the background refresh loop.

use super::cache::{FeedCache, SecondaryBundle};
use super::entry::FeedEntry;
use crate::config::{FeedConfig, SchedulerConfig};
use crate::error::Result;
use crate::fetch::{FetchRequest, Fetcher};
use crate::scheduler::{OperationClass, OperationScheduler};
use nostr::{
    Event, KIND_METADATA, KIND_REACTION, KIND_REPOST, KIND_SHORT_TEXT_NOTE, sort_events, unix_now,
};
use nostr_client::Filter;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

/// Loads the hashtag feed into a [`FeedCache`].
pub struct FeedLoader {
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<FeedCache>,
    scheduler: Arc<OperationScheduler>,
    relays: Vec<String>,
    fetch_timeout: Duration,
    config: FeedConfig,
    scheduler_config: SchedulerConfig,
}

impl FeedLoader {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        cache: Arc<FeedCache>,
        scheduler: Arc<OperationScheduler>,
        relays: Vec<String>,
        fetch_timeout: Duration,
        config: FeedConfig,
        scheduler_config: SchedulerConfig,
    ) -> Self {
        Self {
            fetcher,
            cache,
            scheduler,
            relays,
            fetch_timeout,
            config,
            scheduler_config,
        }
    }

    pub fn cache(&self) -> &Arc<FeedCache> {
        &self.cache
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    /// Filter for feed posts.
    pub fn posts_filter(&self, since: u64, limit: usize) -> Filter {
        Filter::new()
            .kinds(vec![KIND_SHORT_TEXT_NOTE])
            .hashtags(vec![self.config.hashtag.clone()])
            .since(since)
            .limit(limit as u64)
    }

    fn request(&self, filter: Filter) -> FetchRequest {
        FetchRequest::new(filter)
            .relays(self.relays.clone())
            .timeout(self.fetch_timeout)
    }

    /// Load the feed, reusing the cache while it is fresh unless `force`.
    ///
    /// When admission never comes the current cache is returned untouched.
    pub async fn load(&self, force: bool) -> Result<Arc<Vec<FeedEntry>>> {
        if !force && self.cache.is_valid() {
            debug!("Feed cache still fresh, skipping load");
            return Ok(self.cache.get_cached());
        }

        let mut backoff = self.scheduler_config.backoff();
        let Some(_guard) = self
            .scheduler
            .admit(OperationClass::Feed, &mut backoff)
            .await
        else {
            return Ok(self.cache.get_cached());
        };

        self.cache.set_loading(true);
        let result = self.load_admitted().await;
        self.cache.set_loading(false);
        result
    }

    async fn load_admitted(&self) -> Result<Arc<Vec<FeedEntry>>> {
        self.cache.set_progress(10);
        let since = unix_now().saturating_sub(self.config.window().as_secs());
        let limit = self.config.initial_limit;
        let report = self
            .fetcher
            .fetch(&self.request(self.posts_filter(since, limit)).limit(limit))
            .await;

        if report.is_empty() {
            self.cache.set_progress(100);
            if !self.cache.is_empty() {
                warn!("Feed fetch returned nothing, keeping cached entries");
                return Ok(self.cache.get_cached());
            }
            return report.into_result().map(|_| self.cache.get_cached());
        }

        let mut posts = report.events;
        sort_events(&mut posts);
        self.cache.set_progress(40);

        // Render basic entries first, enrich once secondary data is in
        self.cache
            .replace(posts.iter().map(FeedEntry::from_event).collect());
        self.cache.set_progress(60);

        let secondary = self.load_secondary(&posts).await;
        self.cache.set_progress(90);
        self.cache.store_secondary(secondary);
        self.cache.apply_secondary();
        self.cache.set_progress(100);

        info!(count = posts.len(), "Feed loaded");
        Ok(self.cache.get_cached())
    }

    /// Fetch posts newer than the newest cached one and merge them.
    ///
    /// Returns how many entries were added.
    pub async fn refresh_newer(&self, limit: usize) -> usize {
        let since = self
            .cache
            .newest_created_at()
            .unwrap_or_else(|| unix_now().saturating_sub(self.config.window().as_secs()));
        let report = self
            .fetcher
            .fetch(&self.request(self.posts_filter(since, limit)).limit(limit))
            .await;

        let mut posts = report.events;
        sort_events(&mut posts);
        let fresh: Vec<Event> = posts
            .into_iter()
            .filter(|p| !self.cache.contains(&p.id))
            .collect();

        let entries = if fresh.is_empty() {
            Vec::new()
        } else {
            self.cache.store_secondary(self.load_secondary(&fresh).await);
            let secondary = self.cache.secondary();
            fresh
                .iter()
                .map(|p| FeedEntry::from_event(p).enrich(&secondary))
                .collect()
        };
        let added = self.cache.merge_new(entries);
        debug!(added, since, "Refreshed newer feed posts");
        added
    }

    /// Profiles, likes, reposts and comments for `posts`.
    pub async fn load_secondary(&self, posts: &[Event]) -> SecondaryBundle {
        if posts.is_empty() {
            return SecondaryBundle::default();
        }
        let authors: Vec<String> = posts
            .iter()
            .map(|p| p.pubkey.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let ids: Vec<String> = posts.iter().map(|p| p.id.clone()).collect();

        let profiles = self.request(
            Filter::new()
                .kinds(vec![KIND_METADATA])
                .authors(authors),
        );
        let by_target = |kind: u16| {
            self.request(
                Filter::new()
                    .kinds(vec![kind])
                    .event_refs(ids.clone()),
            )
        };
        let (likes, reposts, comments) = (
            by_target(KIND_REACTION),
            by_target(KIND_REPOST),
            by_target(KIND_SHORT_TEXT_NOTE),
        );

        let (profiles, likes, reposts, comments) = tokio::join!(
            self.fetcher.fetch(&profiles),
            self.fetcher.fetch(&likes),
            self.fetcher.fetch(&reposts),
            self.fetcher.fetch(&comments),
        );
        SecondaryBundle {
            profiles: profiles.events,
            likes: likes.events,
            reposts: reposts.events,
            comments: comments.events,
        }
    }
}

/// Periodic low-priority refresh of the feed cache.
///
/// Each tick yields to any higher-priority work and skips rounds that would
/// follow a fetch too closely. Aborted on [`stop`](Self::stop) or drop.
pub struct BackgroundRefresh {
    handle: JoinHandle<()>,
}

impl BackgroundRefresh {
    pub fn spawn(loader: Arc<FeedLoader>, scheduler: Arc<OperationScheduler>) -> Self {
        let period = loader.config().refresh_interval();
        let min_interval = loader.config().min_refresh_interval();
        let limit = loader.config().background_limit;

        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                run_round(&loader, &scheduler, min_interval, limit).await;
            }
        });
        info!(?period, "Background feed refresh started");
        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
        info!("Background feed refresh stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for BackgroundRefresh {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run_round(
    loader: &FeedLoader,
    scheduler: &Arc<OperationScheduler>,
    min_interval: Duration,
    limit: usize,
) {
    if scheduler.should_yield(OperationClass::Background) {
        debug!("Background refresh yielding to higher-priority work");
        return;
    }
    let guard = scheduler.enter(OperationClass::Background);
    if !guard.admitted() {
        debug!("Background refresh not admitted this round");
        return;
    }
    if loader.cache().is_empty() {
        debug!("Feed not loaded yet, nothing to refresh");
        return;
    }
    if loader
        .cache()
        .last_fetch_age()
        .is_some_and(|age| age < min_interval)
    {
        debug!("Feed fetched recently, skipping background round");
        return;
    }
    loader.refresh_newer(limit).await;
}
