//! Hashtag feed: processed entries, the TTL cache and its loaders.

mod cache;
mod entry;
mod loader;

pub use cache::{
    DEFAULT_CACHE_TTL, FeedCache, Secondary, SecondaryBundle, SecondaryData, SecondaryKind,
};
pub use entry::{FeedEntry, PLACEHOLDER_NAME, Profile, extract_image_urls, merge_processed};
pub use loader::{BackgroundRefresh, FeedLoader};
