//! Entity and item store documents.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use super::persist::{read_json, write_json_atomic};
use super::{AggregateStats, Entity, Item, StoreError};

const CRAWL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn crawl_time_now() -> String {
    chrono::Local::now().format(CRAWL_TIME_FORMAT).to_string()
}

/// On-disk layout of the entity store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityDocument {
    /// Number of stored entities.
    #[serde(default, alias = "total_singers")]
    pub total_entities: usize,
    /// Local time of the last write.
    #[serde(default)]
    pub crawl_time: String,
    /// Entities in discovery order.
    #[serde(default, alias = "singers")]
    pub entities: Vec<Entity>,
}

/// On-disk layout of the item store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemDocument {
    /// Number of stored items.
    #[serde(default, alias = "total_songs")]
    pub total_items: usize,
    /// Number of distinct owning entities.
    #[serde(default, alias = "total_singers")]
    pub total_entities: usize,
    /// Local time of the last merge.
    #[serde(default)]
    pub crawl_time: String,
    /// Item count per entity name.
    #[serde(default, alias = "singer_stats")]
    pub items_per_entity: BTreeMap<String, usize>,
    /// Items in first-discovery order.
    #[serde(default, alias = "songs")]
    pub items: Vec<Item>,
}

impl ItemDocument {
    fn apply_stats(&mut self, stats: &AggregateStats) {
        self.total_items = stats.total_items;
        self.total_entities = stats.total_entities;
        self.items_per_entity.clone_from(&stats.items_per_entity);
    }
}

/// Persisted entity collection.
///
/// Entities are append-only: a re-discovered id leaves the stored record as is.
#[derive(Debug)]
pub struct EntityStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl EntityStore {
    /// Creates a store backed by `path`. Nothing is read until first use.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads all stored entities. A missing file is an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be read or parsed.
    pub async fn load(&self) -> Result<Vec<Entity>, StoreError> {
        Ok(read_json::<EntityDocument>(&self.path)
            .await?
            .unwrap_or_default()
            .entities)
    }

    /// Appends entities whose ids are not yet stored. Returns how many were new.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the document cannot be read or written.
    #[instrument(skip(self, entities), fields(path = %self.path.display(), incoming = entities.len()))]
    pub async fn merge(&self, entities: &[Entity]) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut doc = read_json::<EntityDocument>(&self.path)
            .await?
            .unwrap_or_default();
        let mut known: HashSet<String> = doc.entities.iter().map(|e| e.id.clone()).collect();

        let mut inserted = 0;
        for entity in entities {
            if known.insert(entity.id.clone()) {
                doc.entities.push(entity.clone());
                inserted += 1;
            }
        }

        doc.total_entities = doc.entities.len();
        doc.crawl_time = crawl_time_now();
        write_json_atomic(&self.path, &doc).await?;

        info!(inserted, total = doc.total_entities, "entity store updated");
        Ok(inserted)
    }
}

/// Result of merging one batch into the item store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeCounts {
    /// Records with new ids.
    pub inserted: usize,
    /// Existing records whose fields changed.
    pub updated: usize,
    /// Existing records that were already up to date.
    pub unchanged: usize,
    /// Aggregates recomputed from the merged collection.
    pub stats: AggregateStats,
}

/// Persisted item collection, the single source of truth for downloads.
#[derive(Debug)]
pub struct ItemStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ItemStore {
    /// Creates a store backed by `path`. Nothing is read until first use.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the whole document. A missing file is an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be read or parsed.
    pub async fn load(&self) -> Result<ItemDocument, StoreError> {
        Ok(read_json::<ItemDocument>(&self.path)
            .await?
            .unwrap_or_default())
    }

    /// Recomputes aggregates from the stored collection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be read or parsed.
    pub async fn stats(&self) -> Result<AggregateStats, StoreError> {
        Ok(AggregateStats::from_items(&self.load().await?.items))
    }

    /// Merges a batch by item id and atomically rewrites the document.
    ///
    /// This is the only mutation point of the item store and it is serialized:
    /// concurrent callers queue on the store lock, each one reading the state
    /// the previous one committed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the document cannot be read or written. The
    /// stored document is left untouched in that case.
    #[instrument(skip(self, incoming), fields(path = %self.path.display(), incoming = incoming.len()))]
    pub async fn merge(&self, incoming: Vec<Item>) -> Result<MergeCounts, StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut doc = self.load().await?;
        let mut index: HashMap<String, usize> = doc
            .items
            .iter()
            .enumerate()
            .map(|(pos, item)| (item.id.clone(), pos))
            .collect();

        let mut counts = MergeCounts::default();
        for item in incoming {
            if let Some(&pos) = index.get(&item.id) {
                if doc.items[pos].absorb(item) {
                    counts.updated += 1;
                } else {
                    counts.unchanged += 1;
                }
            } else {
                index.insert(item.id.clone(), doc.items.len());
                doc.items.push(item);
                counts.inserted += 1;
            }
        }

        counts.stats = AggregateStats::from_items(&doc.items);
        doc.apply_stats(&counts.stats);
        doc.crawl_time = crawl_time_now();
        write_json_atomic(&self.path, &doc).await?;

        debug!(
            inserted = counts.inserted,
            updated = counts.updated,
            unchanged = counts.unchanged,
            total_items = counts.stats.total_items,
            "item store merged"
        );
        Ok(counts)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::record::tests::item;
    use tempfile::TempDir;

    fn entity(id: &str, name: &str) -> Entity {
        Entity {
            id: id.to_string(),
            name: name.to_string(),
            url: format!("https://example.com/singer/{id}/1.html"),
            base_url: format!("https://example.com/singer/{id}"),
        }
    }

    // ==================== ItemStore Tests ====================

    #[tokio::test]
    async fn test_merge_into_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = ItemStore::new(dir.path().join("items.json"));

        let counts = store
            .merge(vec![item("a", "1", "A"), item("b", "2", "B")])
            .await
            .unwrap();
        assert_eq!(counts.inserted, 2);
        assert_eq!(counts.stats.total_items, 2);
        assert_eq!(counts.stats.total_entities, 2);

        let doc = store.load().await.unwrap();
        assert_eq!(doc.total_items, 2);
        assert!(!doc.crawl_time.is_empty());
    }

    #[tokio::test]
    async fn test_merge_same_record_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = ItemStore::new(dir.path().join("items.json"));

        store.merge(vec![item("a", "1", "A")]).await.unwrap();
        let counts = store.merge(vec![item("a", "1", "A")]).await.unwrap();

        assert_eq!(counts.inserted, 0);
        assert_eq!(counts.unchanged, 1);
        assert_eq!(counts.stats.total_items, 1);
        assert_eq!(store.load().await.unwrap().items.len(), 1);
    }

    #[tokio::test]
    async fn test_merge_same_id_keeps_latest_title() {
        let dir = TempDir::new().unwrap();
        let store = ItemStore::new(dir.path().join("items.json"));

        store.merge(vec![item("a", "1", "First")]).await.unwrap();
        let counts = store.merge(vec![item("a", "1", "Second")]).await.unwrap();

        assert_eq!(counts.updated, 1);
        let doc = store.load().await.unwrap();
        assert_eq!(doc.items.len(), 1);
        assert_eq!(doc.items[0].title, "Second");
    }

    #[tokio::test]
    async fn test_concurrent_merges_preserve_uniqueness() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ItemStore::new(dir.path().join("items.json")));

        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                // Every worker submits the shared id plus one of its own.
                store
                    .merge(vec![
                        item("shared", "1", "Shared"),
                        item(&format!("own-{worker}"), "2", "Own"),
                    ])
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let doc = store.load().await.unwrap();
        assert_eq!(doc.items.len(), 9);
        assert_eq!(doc.total_items, 9);
        let ids: HashSet<_> = doc.items.iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids.len(), 9);
    }

    #[tokio::test]
    async fn test_load_historical_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("songs.json");
        std::fs::write(
            &path,
            r#"{
                "total_songs": 1,
                "total_singers": 1,
                "crawl_time": "2024-05-01 10:00:00",
                "singer_stats": {"Singer": 1},
                "songs": [{
                    "id": "abc", "title": "T", "url": "u", "singer_id": "9",
                    "singer_name": "Singer", "download_url": "d",
                    "file_size": null, "duration": null
                }]
            }"#,
        )
        .unwrap();

        let store = ItemStore::new(&path);
        let doc = store.load().await.unwrap();
        assert_eq!(doc.total_items, 1);
        assert_eq!(doc.items[0].entity_id, "9");
        assert_eq!(store.stats().await.unwrap().total_entities, 1);
    }

    // ==================== EntityStore Tests ====================

    #[tokio::test]
    async fn test_entity_merge_appends_new_ids_only() {
        let dir = TempDir::new().unwrap();
        let store = EntityStore::new(dir.path().join("entities.json"));

        let inserted = store
            .merge(&[entity("1", "One"), entity("2", "Two")])
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        let inserted = store
            .merge(&[entity("2", "Renamed"), entity("3", "Three")])
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let entities = store.load().await.unwrap();
        assert_eq!(entities.len(), 3);
        assert_eq!(entities[1].name, "Two", "stored entities are immutable");
    }

    #[tokio::test]
    async fn test_entity_load_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = EntityStore::new(dir.path().join("absent.json"));
        assert!(store.load().await.unwrap().is_empty());
    }
}
