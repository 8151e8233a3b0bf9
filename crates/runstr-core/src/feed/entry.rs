//! Feed entries and the author profiles shown with them.

use super::cache::SecondaryData;
use nostr::{Event, KIND_METADATA};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;

static IMAGE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)https?://[^\s]+\.(jpg|jpeg|png|gif|webp)").expect("image pattern compiles")
});

/// Name shown until the author's profile arrives.
pub const PLACEHOLDER_NAME: &str = "Loading...";

/// Kind 0 profile content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        alias = "displayName",
        skip_serializing_if = "Option::is_none"
    )]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lud16: Option<String>,
}

impl Profile {
    pub fn placeholder() -> Self {
        Self {
            name: Some(PLACEHOLDER_NAME.to_string()),
            ..Default::default()
        }
    }

    /// Parse a kind 0 event. Anything else, or unparseable content, is `None`.
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.kind != KIND_METADATA {
            return None;
        }
        serde_json::from_str(&event.content).ok()
    }

    /// Best name to show.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .or(self.name.as_deref().filter(|n| !n.is_empty()))
            .unwrap_or("Anonymous")
    }
}

/// A processed feed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEntry {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub content: String,
    pub tags: Vec<Vec<String>>,
    pub images: Vec<String>,
    pub author: Profile,
    pub likes: usize,
    pub reposts: usize,
    pub comments: usize,
    /// Profile and counters are still placeholders
    pub needs_enrichment: bool,
}

impl FeedEntry {
    /// Cheap conversion used to render before secondary data arrives.
    pub fn from_event(event: &Event) -> Self {
        Self {
            id: event.id.clone(),
            pubkey: event.pubkey.clone(),
            created_at: event.created_at,
            content: event.content.clone(),
            tags: event.tags.clone(),
            images: extract_image_urls(&event.content),
            author: Profile::placeholder(),
            likes: 0,
            reposts: 0,
            comments: 0,
            needs_enrichment: true,
        }
    }

    /// Copy with profile and counters filled from `secondary`.
    pub fn enrich(&self, secondary: &SecondaryData) -> Self {
        let author = secondary
            .profiles
            .get(&self.pubkey)
            .cloned()
            .unwrap_or_else(|| self.author.clone());
        let count = |map: &HashMap<String, Vec<Event>>| map.get(&self.id).map_or(0, Vec::len);

        Self {
            author,
            likes: count(&secondary.likes),
            reposts: count(&secondary.reposts),
            comments: count(&secondary.comments),
            needs_enrichment: false,
            ..self.clone()
        }
    }
}

/// Image links in note content, in order of appearance.
pub fn extract_image_urls(content: &str) -> Vec<String> {
    IMAGE_URL
        .find_iter(content)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Replace entries of `basic` with their counterpart in `enriched`, keeping
/// the order and membership of `basic`.
pub fn merge_processed(basic: &[FeedEntry], enriched: &[FeedEntry]) -> Vec<FeedEntry> {
    let by_id: HashMap<&str, &FeedEntry> = enriched.iter().map(|e| (e.id.as_str(), e)).collect();
    basic
        .iter()
        .map(|entry| {
            by_id
                .get(entry.id.as_str())
                .map_or_else(|| entry.clone(), |e| (*e).clone())
        })
        .collect()
}
