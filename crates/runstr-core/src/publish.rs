//! Signing and publishing seams.

use crate::error::Result;
use async_trait::async_trait;
use nostr::{Event, EventTemplate, Keys};
use nostr_client::RelayPool;
use std::time::Duration;
use tracing::{debug, warn};

/// Something that can sign events for the current user.
pub trait Signer: Send + Sync {
    /// Hex public key of the signing user
    fn public_key(&self) -> String;

    fn sign(&self, template: &EventTemplate) -> Result<Event>;
}

impl Signer for Keys {
    fn public_key(&self) -> String {
        Keys::public_key(self).to_string()
    }

    fn sign(&self, template: &EventTemplate) -> Result<Event> {
        Ok(Keys::sign(self, template)?)
    }
}

/// Delivers signed events to relays.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Returns how many relays took the event.
    async fn publish(&self, event: &Event, relays: &[String]) -> Result<usize>;
}

/// Publishes through the shared pool, connecting to the hinted relays first.
#[derive(Clone)]
pub struct PoolPublisher {
    pool: RelayPool,
    ensure_grace: Duration,
    wait_timeout: Duration,
}

impl PoolPublisher {
    pub fn new(pool: RelayPool, ensure_grace: Duration, wait_timeout: Duration) -> Self {
        Self {
            pool,
            ensure_grace,
            wait_timeout,
        }
    }
}

#[async_trait]
impl Publisher for PoolPublisher {
    async fn publish(&self, event: &Event, relays: &[String]) -> Result<usize> {
        self.pool.ensure_relays(relays, self.ensure_grace).await;
        if self.pool.connected_relays(relays).await.is_empty() {
            debug!("Waiting for a relay before publishing {}", event.id);
            if !self.pool.wait_for_connected(1, self.wait_timeout).await {
                warn!("Publishing {} without a confirmed connection", event.id);
            }
        }
        Ok(self.pool.publish(event, relays).await?)
    }
}
