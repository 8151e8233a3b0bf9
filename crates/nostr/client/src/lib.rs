//! Nostr relay WebSocket client for RUNSTR.
//!
//! This crate provides:
//! - WebSocket connections to Nostr relays
//! - Message parsing (NIP-01 relay protocol)
//! - One-shot stored-event fetches that stop at EOSE, a limit or a deadline
//! - A shared pool that batches queries and publishes across relays, and
//!   redials relays that dropped, with capped exponential backoff
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_client::{Filter, default_pool};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let pool = default_pool();
//!     pool.ensure_relays(pool.default_relays(), Duration::from_millis(50)).await;
//!     pool.wait_for_connected(1, Duration::from_secs(8)).await;
//!
//!     let filter = Filter::new().kinds(vec![1]).hashtags(vec!["runstr".into()]).limit(21);
//!     let events = pool
//!         .query(vec![filter], &[], Duration::from_secs(4))
//!         .await
//!         .unwrap_or_default();
//!     println!("Fetched {} notes", events.len());
//! }
//! ```

mod backoff;
mod error;
mod message;
mod pool;
mod relay;
mod subscription;

// Re-export main types
pub use backoff::{ExponentialBackoff, Jitter};
pub use error::{ClientError, Result};
pub use message::{ClientMessage, Filter, MessageError, RelayMessage};
pub use pool::{
    PoolConfig, PoolEvent, QueryOutcome, RelayPool, normalize_relay_url, normalize_relay_urls,
};
pub use relay::{Completion, ConnectionState, RelayConfig, RelayConnection, StoredEvents};
pub use subscription::{
    FETCH_SUBSCRIPTION_PREFIX, SubscriptionTracker, generate_fetch_subscription_id,
    generate_subscription_id,
};

/// Default relays for RUNSTR.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://relay.snort.social",
    "wss://purplepag.es",
];

/// Create a relay pool with the default RUNSTR relays.
pub fn default_pool() -> RelayPool {
    RelayPool::with_relays(DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect())
}
