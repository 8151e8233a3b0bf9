//! Relay interaction core for RUNSTR.
//!
//! This crate provides:
//! - An operation scheduler arbitrating auth, group, feed and background work
//! - A dual-path fetch engine: pooled query first, raw per-relay sockets second
//! - A TTL feed cache with additive merges and secondary data
//! - Group membership derived from the NIP-29 add/remove log
//!
//! [`RunstrCore`] wires all of it around one shared [`RelayPool`].
//!
//! # Example
//!
//! ```no_run
//! use nostr_client::Filter;
//! use runstr_core::{CoreConfig, RunstrCore};
//!
//! # async fn example() -> runstr_core::Result<()> {
//! let core = RunstrCore::new(CoreConfig::default(), None);
//! core.connect().await;
//! core.wait_for_connected().await;
//!
//! let report = core
//!     .fetch(Filter::new().kinds(vec![1]).hashtags(vec!["runstr".into()]), None, None, Some(20))
//!     .await;
//! println!("{} notes from {} relays", report.events.len(), report.relays_responded);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod groups;
pub mod publish;
pub mod scheduler;
pub mod subscription;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use config::{
    CoreConfig, FeedConfig, FetchConfig, MembershipConfig, RelayConfig, SchedulerConfig,
};
pub use error::{CoreError, Result};
pub use feed::{BackgroundRefresh, FeedCache, FeedEntry, FeedLoader, Profile, SecondaryKind};
pub use fetch::{
    FallbackFetcher, FetchPath, FetchReport, FetchRequest, Fetcher, PooledFetcher, RawFetcher,
};
pub use groups::{GroupChat, MembershipFact, MembershipService, NoRecordPolicy, derive};
pub use nostr_client::{ExponentialBackoff, Jitter};
pub use publish::{PoolPublisher, Publisher, Signer};
pub use scheduler::{OperationClass, OperationGuard, OperationScheduler};
pub use subscription::Subscription;
pub use telemetry::{LogFormat, init_tracing};

use nostr::Event;
use nostr_client::{Filter, RelayPool, normalize_relay_urls};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// One shared scheduler, pool, fetcher and cache behind the operations the
/// app calls.
pub struct RunstrCore {
    config: CoreConfig,
    relays: Vec<String>,
    pool: RelayPool,
    scheduler: Arc<OperationScheduler>,
    fetcher: Arc<dyn Fetcher>,
    loader: Arc<FeedLoader>,
    membership: MembershipService,
    groups: GroupChat,
    background: Mutex<Option<BackgroundRefresh>>,
}

impl RunstrCore {
    /// Build a core with a fresh pool over the configured relays.
    pub fn new(config: CoreConfig, signer: Option<Arc<dyn Signer>>) -> Self {
        let pool = RelayPool::with_relays(config.relays.urls.clone());
        Self::with_pool(config, pool, signer)
    }

    /// Build a core on an existing pool, using the pooled path with the raw
    /// path as fallback.
    pub fn with_pool(config: CoreConfig, pool: RelayPool, signer: Option<Arc<dyn Signer>>) -> Self {
        let fetcher = FallbackFetcher::with_budget(
            PooledFetcher::new(pool.clone(), config.relays.ensure_grace()),
            RawFetcher::new(config.fetch.raw_relay_timeout()),
            config.fetch.pooled_budget(),
        );
        let publisher = PoolPublisher::new(
            pool.clone(),
            config.relays.ensure_grace(),
            config.relays.wait_timeout(),
        );
        Self::from_parts(config, pool, Arc::new(fetcher), Arc::new(publisher), signer)
    }

    /// Build a core from explicit fetch and publish strategies.
    pub fn from_parts(
        config: CoreConfig,
        pool: RelayPool,
        fetcher: Arc<dyn Fetcher>,
        publisher: Arc<dyn Publisher>,
        signer: Option<Arc<dyn Signer>>,
    ) -> Self {
        let relays = normalize_relay_urls(&config.relays.urls);
        let timeout = config.fetch.overall_timeout();
        let scheduler = Arc::new(OperationScheduler::new());

        let loader = Arc::new(FeedLoader::new(
            Arc::clone(&fetcher),
            Arc::new(FeedCache::new(config.feed.cache_ttl())),
            Arc::clone(&scheduler),
            relays.clone(),
            timeout,
            config.feed.clone(),
            config.scheduler.clone(),
        ));
        let membership = MembershipService::new(
            Arc::clone(&fetcher),
            Arc::clone(&publisher),
            signer.clone(),
            Arc::clone(&scheduler),
            relays.clone(),
            timeout,
            config.membership.clone(),
            config.scheduler.clone(),
        );
        let groups = GroupChat::new(
            Arc::clone(&fetcher),
            publisher,
            signer,
            relays.clone(),
            timeout,
            config.membership.clone(),
        )
        .with_pool(pool.clone(), config.relays.ensure_grace());

        info!(relays = relays.len(), "RUNSTR core ready");
        Self {
            config,
            relays,
            pool,
            scheduler,
            fetcher,
            loader,
            membership,
            groups,
            background: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Configured relays, normalized.
    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    pub fn scheduler(&self) -> &Arc<OperationScheduler> {
        &self.scheduler
    }

    pub fn cache(&self) -> &Arc<FeedCache> {
        self.loader.cache()
    }

    pub fn feed(&self) -> &Arc<FeedLoader> {
        &self.loader
    }

    pub fn membership(&self) -> &MembershipService {
        &self.membership
    }

    pub fn groups(&self) -> &GroupChat {
        &self.groups
    }

    fn target_relays(&self, relays: Option<&[String]>) -> Vec<String> {
        match relays {
            Some(relays) => normalize_relay_urls(relays),
            None => self.relays.clone(),
        }
    }

    /// Run one logical query.
    ///
    /// `None` relays means the configured set; an explicit empty list returns
    /// an empty report without touching the network.
    pub async fn fetch(
        &self,
        filter: Filter,
        relays: Option<&[String]>,
        timeout: Option<Duration>,
        limit: Option<usize>,
    ) -> FetchReport {
        let relays = self.target_relays(relays);
        if relays.is_empty() {
            debug!("Fetch without relays, returning nothing");
            return FetchReport::empty();
        }

        let mut request = FetchRequest::new(filter)
            .relays(relays)
            .timeout(timeout.unwrap_or_else(|| self.config.fetch.overall_timeout()));
        if let Some(limit) = limit {
            request = request.limit(limit);
        }
        self.fetcher.fetch(&request).await
    }

    /// Live records matching `filter`. Never fails; see [`Subscription::noop`].
    pub async fn subscribe<F>(
        &self,
        filter: Filter,
        relays: Option<&[String]>,
        on_record: F,
        since: Option<u64>,
    ) -> Subscription
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let relays = self.target_relays(relays);
        if relays.is_empty() {
            return Subscription::noop();
        }
        subscription::subscribe(
            &self.pool,
            &relays,
            filter,
            since,
            on_record,
            self.config.relays.ensure_grace(),
        )
        .await
    }

    pub fn start(&self, class: OperationClass) -> bool {
        self.scheduler.start(class)
    }

    pub fn end(&self, class: OperationClass) {
        self.scheduler.end(class)
    }

    pub fn should_yield(&self, class: OperationClass) -> bool {
        self.scheduler.should_yield(class)
    }

    pub async fn is_member(&self, group: &str, actor: &str) -> bool {
        self.membership.is_member(group, actor).await
    }

    pub async fn join(&self, group: &str) -> Result<Option<Event>> {
        self.membership.join(group).await
    }

    pub async fn leave(&self, group: &str, actor: &str) -> Result<Option<Event>> {
        self.membership.leave(group, actor).await
    }

    /// Load the feed, reusing a fresh cache unless `force`.
    pub async fn load_feed(&self, force: bool) -> Result<Arc<Vec<FeedEntry>>> {
        self.loader.load(force).await
    }

    /// Start connecting to the configured relays, waiting at most the ensure
    /// grace period.
    pub async fn connect(&self) {
        self.pool
            .ensure_relays(&self.relays, self.config.relays.ensure_grace())
            .await;
    }

    /// Wait for the configured minimum of connected relays.
    pub async fn wait_for_connected(&self) -> bool {
        self.pool
            .wait_for_connected(
                self.config.relays.min_connected,
                self.config.relays.wait_timeout(),
            )
            .await
    }

    /// Start the periodic feed refresh. Returns `false` if already running.
    pub fn start_background_refresh(&self) -> bool {
        let mut background = self.background.lock();
        if background.as_ref().is_some_and(BackgroundRefresh::is_running) {
            return false;
        }
        *background = Some(BackgroundRefresh::spawn(
            Arc::clone(&self.loader),
            Arc::clone(&self.scheduler),
        ));
        true
    }

    pub fn stop_background_refresh(&self) {
        if let Some(refresh) = self.background.lock().take() {
            refresh.stop();
        }
    }

    /// Stop background work and close every relay connection.
    pub async fn shutdown(&self) {
        self.stop_background_refresh();
        self.pool.disconnect_all().await;
        info!("RUNSTR core shut down");
    }
}
