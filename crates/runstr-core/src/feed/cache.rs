//! TTL-bounded feed cache.
//!
//! Reads clone an `Arc` snapshot and never wait on a writer for long.
//! Mutations are serialized by a writer lock and publish a new snapshot, so a
//! feed load and a background refresh may merge concurrently.

use super::entry::{FeedEntry, Profile, merge_processed};
use nostr::{Event, KIND_METADATA, KIND_REACTION, KIND_REPOST, KIND_SHORT_TEXT_NOTE};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Default freshness window.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Kinds of secondary data kept beside the entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecondaryKind {
    /// Keyed by author pubkey
    Profiles,
    /// Keyed by target event id
    Likes,
    Reposts,
    Comments,
}

/// A secondary lookup result.
#[derive(Debug, Clone, PartialEq)]
pub enum Secondary {
    Profile(Profile),
    Records(Vec<Event>),
}

/// Raw secondary records as fetched, before indexing.
#[derive(Debug, Clone, Default)]
pub struct SecondaryBundle {
    /// Kind 0 events
    pub profiles: Vec<Event>,
    /// Kind 7 events
    pub likes: Vec<Event>,
    /// Kind 6 events
    pub reposts: Vec<Event>,
    /// Kind 1 replies
    pub comments: Vec<Event>,
}

impl SecondaryBundle {
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
            && self.likes.is_empty()
            && self.reposts.is_empty()
            && self.comments.is_empty()
    }
}

/// Indexed secondary data.
#[derive(Debug, Clone, Default)]
pub struct SecondaryData {
    pub profiles: HashMap<String, Profile>,
    pub likes: HashMap<String, Vec<Event>>,
    pub reposts: HashMap<String, Vec<Event>>,
    pub comments: HashMap<String, Vec<Event>>,
    /// created_at of the kind 0 event behind each profile
    profile_times: HashMap<String, u64>,
}

impl SecondaryData {
    fn absorb(&mut self, bundle: SecondaryBundle) {
        for event in bundle.profiles {
            self.absorb_profile(&event);
        }
        append_by_target(&mut self.likes, bundle.likes, KIND_REACTION);
        append_by_target(&mut self.reposts, bundle.reposts, KIND_REPOST);
        append_by_target(&mut self.comments, bundle.comments, KIND_SHORT_TEXT_NOTE);
    }

    fn absorb_profile(&mut self, event: &Event) {
        if event.kind != KIND_METADATA {
            return;
        }
        // Newest metadata per author wins
        if self
            .profile_times
            .get(&event.pubkey)
            .is_some_and(|seen| *seen > event.created_at)
        {
            return;
        }
        if let Some(profile) = Profile::from_event(event) {
            self.profile_times
                .insert(event.pubkey.clone(), event.created_at);
            self.profiles.insert(event.pubkey.clone(), profile);
        }
    }

    fn records(&self, kind: SecondaryKind) -> Option<&HashMap<String, Vec<Event>>> {
        match kind {
            SecondaryKind::Profiles => None,
            SecondaryKind::Likes => Some(&self.likes),
            SecondaryKind::Reposts => Some(&self.reposts),
            SecondaryKind::Comments => Some(&self.comments),
        }
    }
}

/// Index records under their first `e` tag, skipping ids already present.
fn append_by_target(map: &mut HashMap<String, Vec<Event>>, records: Vec<Event>, kind: u16) {
    for record in records {
        if record.kind != kind {
            continue;
        }
        let Some(target) = record.first_tag_value("e").map(str::to_string) else {
            continue;
        };
        let list = map.entry(target).or_default();
        if !list.iter().any(|existing| existing.id == record.id) {
            list.push(record);
        }
    }
}

#[derive(Clone, Default)]
struct Snapshot {
    entries: Arc<Vec<FeedEntry>>,
    ids: Arc<HashSet<String>>,
    fetched_at: Option<Instant>,
    secondary: Arc<SecondaryData>,
}

/// Process-wide feed cache.
pub struct FeedCache {
    ttl: Duration,
    snapshot: RwLock<Snapshot>,
    writer: Mutex<()>,
    progress: watch::Sender<u8>,
    loading: AtomicBool,
    initialized: AtomicBool,
    preloading: AtomicBool,
    preloaded_count: AtomicUsize,
}

impl FeedCache {
    pub fn new(ttl: Duration) -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            ttl,
            snapshot: RwLock::new(Snapshot::default()),
            writer: Mutex::new(()),
            progress,
            loading: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            preloading: AtomicBool::new(false),
            preloaded_count: AtomicUsize::new(0),
        }
    }

    fn current(&self) -> Snapshot {
        self.snapshot.read().clone()
    }

    /// Cached entries, newest batches first.
    pub fn get_cached(&self) -> Arc<Vec<FeedEntry>> {
        Arc::clone(&self.snapshot.read().entries)
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.snapshot.read().ids.contains(id)
    }

    /// Non-empty and fetched within the TTL.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Instant::now())
    }

    pub fn is_valid_at(&self, now: Instant) -> bool {
        let snapshot = self.snapshot.read();
        !snapshot.entries.is_empty()
            && snapshot
                .fetched_at
                .is_some_and(|at| now.saturating_duration_since(at) < self.ttl)
    }

    /// Time since the entries were last replaced or merged.
    pub fn last_fetch_age(&self) -> Option<Duration> {
        self.snapshot.read().fetched_at.map(|at| at.elapsed())
    }

    /// Newest `created_at` among cached entries.
    pub fn newest_created_at(&self) -> Option<u64> {
        self.snapshot
            .read()
            .entries
            .iter()
            .map(|e| e.created_at)
            .max()
    }

    /// Swap in a whole new entry set.
    pub fn replace(&self, entries: Vec<FeedEntry>) {
        let _writer = self.writer.lock();
        let mut next = self.current();

        let mut ids = HashSet::with_capacity(entries.len());
        let entries: Vec<FeedEntry> = entries
            .into_iter()
            .filter(|e| ids.insert(e.id.clone()))
            .collect();
        debug!(count = entries.len(), "Replacing feed cache");

        next.entries = Arc::new(entries);
        next.ids = Arc::new(ids);
        next.fetched_at = Some(Instant::now());
        *self.snapshot.write() = next;
        self.initialized.store(true, Ordering::SeqCst);
    }

    /// Prepend entries not cached yet and mark the cache fresh.
    ///
    /// Existing entries are never touched. Returns how many were added.
    pub fn merge_new(&self, entries: Vec<FeedEntry>) -> usize {
        let _writer = self.writer.lock();
        let mut next = self.current();

        let ids = Arc::make_mut(&mut next.ids);
        let fresh: Vec<FeedEntry> = entries
            .into_iter()
            .filter(|e| ids.insert(e.id.clone()))
            .collect();
        let added = fresh.len();

        if added > 0 {
            let mut merged = fresh;
            merged.extend(next.entries.iter().cloned());
            next.entries = Arc::new(merged);
        }
        next.fetched_at = Some(Instant::now());
        *self.snapshot.write() = next;

        debug!(added, total = self.len(), "Merged into feed cache");
        added
    }

    /// Swap cached entries for enriched copies with the same ids.
    pub fn update_processed(&self, enriched: &[FeedEntry]) {
        let _writer = self.writer.lock();
        let mut next = self.current();
        next.entries = Arc::new(merge_processed(&next.entries, enriched));
        *self.snapshot.write() = next;
    }

    /// Re-enrich every cached entry from the stored secondary data.
    pub fn apply_secondary(&self) {
        let _writer = self.writer.lock();
        let mut next = self.current();
        let enriched = next
            .entries
            .iter()
            .map(|entry| entry.enrich(&next.secondary))
            .collect();
        next.entries = Arc::new(enriched);
        *self.snapshot.write() = next;
    }

    /// Index secondary records, appending ones not seen before.
    pub fn store_secondary(&self, bundle: SecondaryBundle) {
        if bundle.is_empty() {
            return;
        }
        let _writer = self.writer.lock();
        let mut next = self.current();
        Arc::make_mut(&mut next.secondary).absorb(bundle);
        *self.snapshot.write() = next;
    }

    pub fn secondary(&self) -> Arc<SecondaryData> {
        Arc::clone(&self.snapshot.read().secondary)
    }

    /// Profile by pubkey, or reaction records by target event id.
    pub fn get_secondary(&self, kind: SecondaryKind, id: &str) -> Option<Secondary> {
        let secondary = self.secondary();
        match kind {
            SecondaryKind::Profiles => secondary.profiles.get(id).cloned().map(Secondary::Profile),
            _ => secondary
                .records(kind)
                .and_then(|map| map.get(id))
                .cloned()
                .map(Secondary::Records),
        }
    }

    pub fn profile(&self, pubkey: &str) -> Option<Profile> {
        self.secondary().profiles.get(pubkey).cloned()
    }

    /// Loading progress in percent.
    pub fn set_progress(&self, percent: u8) {
        self.progress.send_replace(percent.min(100));
    }

    pub fn progress(&self) -> u8 {
        *self.progress.borrow()
    }

    pub fn watch_progress(&self) -> watch::Receiver<u8> {
        self.progress.subscribe()
    }

    pub fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::SeqCst);
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    /// Whether the cache has been filled at least once.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn set_preloading(&self, preloading: bool) {
        self.preloading.store(preloading, Ordering::SeqCst);
    }

    pub fn is_preloading(&self) -> bool {
        self.preloading.load(Ordering::SeqCst)
    }

    pub fn set_preloaded_count(&self, count: usize) {
        self.preloaded_count.store(count, Ordering::SeqCst);
    }

    pub fn preloaded_count(&self) -> usize {
        self.preloaded_count.load(Ordering::SeqCst)
    }

    /// Drop everything, including secondary data.
    pub fn clear(&self) {
        let _writer = self.writer.lock();
        *self.snapshot.write() = Snapshot::default();
        self.initialized.store(false, Ordering::SeqCst);
        self.set_progress(0);
    }
}

impl Default for FeedCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}
