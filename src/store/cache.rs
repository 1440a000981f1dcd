//! Recency caches: the crawl cache and the download index.
//!
//! Both are JSON documents of the form `{"<section>": {"<id>": <entry>}}`
//! where each entry carries a local naive timestamp. An entry is fresh while
//! `now - timestamp <= ttl`; once older than the TTL the id is due again.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, TimeDelta};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::StoreError;
use super::persist::{read_json, write_json_atomic};

/// Section key of the crawl cache document.
pub const CRAWL_CACHE_SECTION: &str = "singer_last_crawl";

/// Section key of the download index document.
pub const DOWNLOAD_INDEX_SECTION: &str = "songs";

/// Current local time, the clock every cache entry is stamped with.
#[must_use]
pub fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// A cache entry that carries the time it was recorded.
pub trait Stamped {
    /// When the entry was recorded.
    fn stamp(&self) -> NaiveDateTime;
}

impl Stamped for NaiveDateTime {
    fn stamp(&self) -> NaiveDateTime {
        *self
    }
}

/// Download index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    /// When the asset was saved.
    pub ts: NaiveDateTime,
    /// Owning entity name.
    #[serde(default, rename = "singer")]
    pub entity_name: Option<String>,
    /// Item title.
    #[serde(default)]
    pub title: Option<String>,
}

impl Stamped for DownloadRecord {
    fn stamp(&self) -> NaiveDateTime {
        self.ts
    }
}

/// Crawl cache: entity id to last successful crawl time.
pub type CrawlCache = RecencyCache<NaiveDateTime>;

/// Download index: item id to download record.
pub type DownloadIndex = RecencyCache<DownloadRecord>;

/// A persisted map of id to timestamped entry with a freshness TTL.
#[derive(Debug)]
pub struct RecencyCache<E> {
    path: Option<PathBuf>,
    section: &'static str,
    ttl: TimeDelta,
    entries: Mutex<BTreeMap<String, E>>,
}

impl<E> RecencyCache<E>
where
    E: Stamped + Clone + Serialize + DeserializeOwned + Send,
{
    /// Opens the cache document at `path`.
    ///
    /// The cache is advisory, so a missing or unreadable document starts an
    /// empty cache instead of failing.
    pub async fn open(path: impl Into<PathBuf>, section: &'static str, ttl_days: u32) -> Self {
        let path = path.into();
        let entries = match read_json::<BTreeMap<String, serde_json::Value>>(&path).await {
            Ok(Some(mut doc)) => doc
                .remove(section)
                .map(serde_json::from_value::<BTreeMap<String, E>>)
                .transpose()
                .unwrap_or_else(|e| {
                    warn!(path = %path.display(), error = %e, "ignoring malformed cache section");
                    None
                })
                .unwrap_or_default(),
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable cache document");
                BTreeMap::new()
            }
        };
        debug!(path = %path.display(), section, entries = entries.len(), "cache opened");

        Self {
            path: Some(path),
            section,
            ttl: TimeDelta::days(i64::from(ttl_days)),
            entries: Mutex::new(entries),
        }
    }

    /// Creates a cache that is never persisted.
    #[must_use]
    pub fn in_memory(section: &'static str, ttl_days: u32) -> Self {
        Self {
            path: None,
            section,
            ttl: TimeDelta::days(i64::from(ttl_days)),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the backing document path, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether `id` was recorded within the TTL.
    pub async fn is_fresh(&self, id: &str) -> bool {
        self.is_fresh_at(id, now()).await
    }

    /// Whether `id` was recorded within the TTL as of `at`.
    pub async fn is_fresh_at(&self, id: &str, at: NaiveDateTime) -> bool {
        self.entries
            .lock()
            .await
            .get(id)
            .is_some_and(|entry| at.signed_duration_since(entry.stamp()) <= self.ttl)
    }

    /// Returns the stored entry for `id`.
    pub async fn get(&self, id: &str) -> Option<E> {
        self.entries.lock().await.get(id).cloned()
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Stores `entry` for `id` and persists the document.
    ///
    /// Concurrent writers serialize on the cache lock; the last writer wins.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the document cannot be written. The in-memory
    /// entry is kept either way.
    pub async fn record(&self, id: &str, entry: E) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(id.to_string(), entry);

        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut doc = BTreeMap::new();
        doc.insert(self.section, &*entries);
        write_json_atomic(path, &doc).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TTL_DAYS: u32 = 28;

    fn days_ago(days: u32) -> NaiveDateTime {
        now() - TimeDelta::days(i64::from(days))
    }

    #[tokio::test]
    async fn test_entry_within_ttl_is_fresh() {
        let cache = CrawlCache::in_memory(CRAWL_CACHE_SECTION, TTL_DAYS);
        cache.record("e1", days_ago(TTL_DAYS - 1)).await.unwrap();
        assert!(cache.is_fresh("e1").await);
    }

    #[tokio::test]
    async fn test_entry_past_ttl_is_stale() {
        let cache = CrawlCache::in_memory(CRAWL_CACHE_SECTION, TTL_DAYS);
        cache.record("e1", days_ago(TTL_DAYS + 1)).await.unwrap();
        assert!(!cache.is_fresh("e1").await);
    }

    #[tokio::test]
    async fn test_missing_entry_is_stale() {
        let cache = CrawlCache::in_memory(CRAWL_CACHE_SECTION, TTL_DAYS);
        assert!(!cache.is_fresh("unknown").await);
    }

    #[tokio::test]
    async fn test_record_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("crawl_cache.json");

        let cache = CrawlCache::open(&path, CRAWL_CACHE_SECTION, TTL_DAYS).await;
        cache.record("e1", now()).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw[CRAWL_CACHE_SECTION]["e1"].is_string());

        let reopened = CrawlCache::open(&path, CRAWL_CACHE_SECTION, TTL_DAYS).await;
        assert!(reopened.is_fresh("e1").await);
    }

    #[tokio::test]
    async fn test_open_reads_historical_timestamps() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("crawl_cache.json");
        let recent = days_ago(1).format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
        std::fs::write(
            &path,
            format!(r#"{{"singer_last_crawl": {{"42": "{recent}"}}}}"#),
        )
        .unwrap();

        let cache = CrawlCache::open(&path, CRAWL_CACHE_SECTION, TTL_DAYS).await;
        assert!(cache.is_fresh("42").await);
    }

    #[tokio::test]
    async fn test_open_malformed_document_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("crawl_cache.json");
        std::fs::write(&path, "][").unwrap();

        let cache = CrawlCache::open(&path, CRAWL_CACHE_SECTION, TTL_DAYS).await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_download_index_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("downloaded_cache.json");

        let index = DownloadIndex::open(&path, DOWNLOAD_INDEX_SECTION, 180).await;
        index
            .record(
                "abc",
                DownloadRecord {
                    ts: now(),
                    entity_name: Some("Singer".to_string()),
                    title: Some("Song".to_string()),
                },
            )
            .await
            .unwrap();

        let reopened = DownloadIndex::open(&path, DOWNLOAD_INDEX_SECTION, 180).await;
        assert!(reopened.is_fresh("abc").await);
        let entry = reopened.get("abc").await.unwrap();
        assert_eq!(entry.entity_name.as_deref(), Some("Singer"));
    }
}
