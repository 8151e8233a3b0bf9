//! Group chat, group metadata and the list of groups a user follows.

use crate::config::MembershipConfig;
use crate::error::{CoreError, Result};
use crate::fetch::{FetchRequest, Fetcher};
use crate::publish::{Publisher, Signer};
use crate::subscription::{self, Subscription};
use nostr::{
    AddressPointer, Event, EventTemplate, GROUP_LIST_IDENTIFIER, GroupMetadata,
    KIND_GROUP_CHAT_MESSAGE, KIND_GROUP_LIST, KIND_GROUP_METADATA, chat_message_tags,
    decode_naddr, group_coordinate, group_list_entries, metadata_tags, sort_events,
};
use nostr_client::{Filter, RelayPool};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Chat and metadata for NIP-29 groups.
pub struct GroupChat {
    fetcher: Arc<dyn Fetcher>,
    publisher: Arc<dyn Publisher>,
    signer: Option<Arc<dyn Signer>>,
    pool: Option<RelayPool>,
    relays: Vec<String>,
    timeout: Duration,
    ensure_grace: Duration,
    config: MembershipConfig,
    /// Keyed by naddr
    metadata: Mutex<HashMap<String, GroupMetadata>>,
}

impl GroupChat {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        publisher: Arc<dyn Publisher>,
        signer: Option<Arc<dyn Signer>>,
        relays: Vec<String>,
        timeout: Duration,
        config: MembershipConfig,
    ) -> Self {
        Self {
            fetcher,
            publisher,
            signer,
            pool: None,
            relays,
            timeout,
            ensure_grace: Duration::from_millis(50),
            config,
            metadata: Mutex::new(HashMap::new()),
        }
    }

    /// Enable live subscriptions through `pool`.
    pub fn with_pool(mut self, pool: RelayPool, ensure_grace: Duration) -> Self {
        self.pool = Some(pool);
        self.ensure_grace = ensure_grace;
        self
    }

    fn messages_filter(&self, group: &str) -> Filter {
        Filter::new()
            .kinds(self.config.message_kinds.clone())
            .groups(vec![group.to_string()])
    }

    fn relays_or_default(&self, relays: &[String]) -> Vec<String> {
        if relays.is_empty() {
            self.relays.clone()
        } else {
            relays.to_vec()
        }
    }

    /// Recent messages for `group`, oldest first.
    ///
    /// Relays that answer with nothing give an empty list; relays that can't
    /// be reached give an error.
    pub async fn fetch_messages(&self, group: &str, limit: Option<usize>) -> Result<Vec<Event>> {
        let limit = limit.unwrap_or(self.config.message_limit);
        let request = FetchRequest::new(self.messages_filter(group).limit(limit as u64))
            .relays(self.relays.clone())
            .timeout(self.timeout);

        let mut events = match self.fetcher.fetch(&request).await.into_result() {
            Ok(events) => events,
            Err(CoreError::NothingFound) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        sort_events(&mut events);
        events.truncate(limit);
        events.reverse();
        debug!(group, count = events.len(), "Fetched group messages");
        Ok(events)
    }

    /// Live messages for `group`. A no-op subscription when there is no pool
    /// or no relay takes the request.
    pub async fn subscribe_messages<F>(
        &self,
        group: &str,
        since: Option<u64>,
        on_record: F,
    ) -> Subscription
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let Some(pool) = &self.pool else {
            debug!(group, "No pool for live messages");
            return Subscription::noop();
        };
        subscription::subscribe(
            pool,
            &self.relays,
            self.messages_filter(group),
            since,
            on_record,
            self.ensure_grace,
        )
        .await
    }

    /// Post a chat message to `group`.
    pub async fn send_message(&self, group: &str, content: &str) -> Result<Event> {
        let signer = self.signer.as_ref().ok_or(CoreError::NoSigner)?;
        let template = EventTemplate::new(KIND_GROUP_CHAT_MESSAGE, content)
            .tags(chat_message_tags(group, &signer.public_key()));
        let event = signer.sign(&template)?;
        let accepted = self.publisher.publish(&event, &self.relays).await?;
        debug!(group, id = %event.id, accepted, "Sent group message");
        Ok(event)
    }

    /// Metadata for the group `naddr` points at.
    ///
    /// Found metadata is cached for the life of this value. `None` when the
    /// relays hold no metadata record.
    pub async fn fetch_metadata(&self, naddr: &str) -> Result<Option<GroupMetadata>> {
        if let Some(cached) = self.metadata.lock().get(naddr) {
            return Ok(Some(cached.clone()));
        }

        let pointer =
            decode_naddr(naddr).map_err(|e| CoreError::InvalidGroup(format!("{naddr}: {e}")))?;
        let filter = Filter::new()
            .kinds(vec![KIND_GROUP_METADATA])
            .authors(vec![pointer.pubkey.clone()])
            .identifiers(vec![pointer.identifier.clone()])
            .limit(1);
        let request = FetchRequest::new(filter)
            .relays(self.relays_or_default(&pointer.relays))
            .timeout(self.timeout);

        let events = match self.fetcher.fetch(&request).await.into_result() {
            Ok(events) => events,
            Err(CoreError::NothingFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        let Some(newest) = events.iter().max_by_key(|e| e.created_at) else {
            return Ok(None);
        };

        let metadata = GroupMetadata::from_event(newest, &pointer.identifier);
        self.metadata
            .lock()
            .insert(naddr.to_string(), metadata.clone());
        Ok(Some(metadata))
    }

    /// Publish metadata for the group `identifier`, advertising `relays`.
    pub async fn publish_metadata(
        &self,
        identifier: &str,
        metadata: &GroupMetadata,
        relays: &[String],
    ) -> Result<Event> {
        let signer = self.signer.as_ref().ok_or(CoreError::NoSigner)?;
        let content = serde_json::to_string(metadata)
            .map_err(|e| CoreError::InvalidGroup(format!("{identifier}: {e}")))?;
        let template = EventTemplate::new(KIND_GROUP_METADATA, content)
            .tags(metadata_tags(identifier, relays));
        let event = signer.sign(&template)?;

        let targets = self.relays_or_default(relays);
        self.publisher.publish(&event, &targets).await?;
        let author = signer.public_key();
        self.metadata.lock().retain(|naddr, _| {
            !decode_naddr(naddr).is_ok_and(|p| p.identifier == identifier && p.pubkey == author)
        });
        info!(identifier, "Published group metadata");
        Ok(event)
    }

    /// Groups in `pubkey`'s newest group list. Empty when there is no list.
    pub async fn fetch_user_groups(&self, pubkey: &str) -> Result<Vec<AddressPointer>> {
        let filter = Filter::new()
            .kinds(vec![KIND_GROUP_LIST])
            .authors(vec![pubkey.to_string()])
            .identifiers(vec![GROUP_LIST_IDENTIFIER.to_string()]);
        let request = FetchRequest::new(filter)
            .relays(self.relays.clone())
            .timeout(self.timeout);

        let mut lists = match self.fetcher.fetch(&request).await.into_result() {
            Ok(events) => events,
            Err(CoreError::NothingFound) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        sort_events(&mut lists);
        let groups = lists.first().map(group_list_entries).unwrap_or_default();
        debug!(pubkey, count = groups.len(), "Fetched user group list");
        Ok(groups)
    }

    /// Whether the group `naddr` points at is in `pubkey`'s group list.
    pub async fn has_joined_group(&self, pubkey: &str, naddr: &str) -> Result<bool> {
        let pointer =
            decode_naddr(naddr).map_err(|e| CoreError::InvalidGroup(format!("{naddr}: {e}")))?;
        let wanted = group_coordinate(&pointer);
        Ok(self
            .fetch_user_groups(pubkey)
            .await?
            .iter()
            .any(|group| group_coordinate(group) == wanted))
    }

    /// Drop every cached metadata entry.
    pub fn clear_metadata_cache(&self) {
        self.metadata.lock().clear();
    }
}
