//! Persisted documents: the entity store, the item store, and the recency
//! caches that gate re-crawls and re-downloads.
//!
//! All documents are JSON files replaced atomically (temp file + rename), so a
//! reader observes either the previous or the new version, never a partial
//! write. Mutations of one store are serialized through that store's lock.

mod cache;
mod documents;
mod error;
mod persist;
mod record;

pub use cache::{
    CRAWL_CACHE_SECTION, CrawlCache, DOWNLOAD_INDEX_SECTION, DownloadIndex, DownloadRecord,
    RecencyCache, Stamped, now,
};
pub use documents::{EntityDocument, EntityStore, ItemDocument, ItemStore, MergeCounts};
pub use error::StoreError;
pub(crate) use persist::{read_json, write_json_atomic};
pub use record::{AggregateStats, Entity, Item};

#[cfg(test)]
pub(crate) use record::tests::item as test_item;
