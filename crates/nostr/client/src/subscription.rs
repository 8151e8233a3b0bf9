//! Subscription ids and EOSE tracking across relays.

use crate::message::Filter;
use std::collections::HashSet;
use uuid::Uuid;

/// Prefix for ids of one-shot raw fetches.
pub const FETCH_SUBSCRIPTION_PREFIX: &str = "wsfetch-";

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Generate an ID for a one-shot fetch, e.g. `wsfetch-1a2b3c4d`.
pub fn generate_fetch_subscription_id() -> String {
    format!("{}{}", FETCH_SUBSCRIPTION_PREFIX, generate_subscription_id())
}

/// Tracks which relays have a specific subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionTracker {
    /// Subscription ID
    pub id: String,
    /// Filters for this subscription
    pub filters: Vec<Filter>,
    /// Relays that have this subscription
    pub relays: HashSet<String>,
    /// Whether EOSE has been received from all relays
    pub all_eose: bool,
    /// Relays that have sent EOSE
    pub eose_relays: HashSet<String>,
}

impl SubscriptionTracker {
    /// Create a new subscription tracker.
    pub fn new(id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self {
            id: id.into(),
            filters,
            relays: HashSet::new(),
            all_eose: false,
            eose_relays: HashSet::new(),
        }
    }

    /// Add a relay to this subscription.
    pub fn add_relay(&mut self, relay_url: impl Into<String>) {
        self.relays.insert(relay_url.into());
        self.update_all_eose();
    }

    /// Remove a relay from this subscription.
    pub fn remove_relay(&mut self, relay_url: &str) {
        self.relays.remove(relay_url);
        self.eose_relays.remove(relay_url);
        self.update_all_eose();
    }

    /// Mark EOSE received from a relay. Relays outside the subscription are ignored.
    pub fn mark_eose(&mut self, relay_url: &str) {
        if self.relays.contains(relay_url) {
            self.eose_relays.insert(relay_url.to_string());
            self.update_all_eose();
        }
    }

    fn update_all_eose(&mut self) {
        self.all_eose = !self.relays.is_empty() && self.relays.len() == self.eose_relays.len();
    }

    /// Check if a relay has this subscription.
    pub fn has_relay(&self, relay_url: &str) -> bool {
        self.relays.contains(relay_url)
    }
}
