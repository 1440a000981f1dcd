//! Entity and item records.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

/// A content producer discovered in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique key.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Canonical page URL.
    pub url: String,
    /// Root used to build paginated listing URLs.
    pub base_url: String,
}

/// An asset record belonging to an entity.
///
/// Field aliases accept documents written with the historical key names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Stable key supplied by the extractor.
    pub id: String,
    /// Most recently observed title.
    pub title: String,
    /// Page the item was discovered on.
    #[serde(alias = "url")]
    pub source_url: String,
    /// Owning entity id.
    #[serde(alias = "singer_id")]
    pub entity_id: String,
    /// Owning entity name, denormalized for reporting and file naming.
    #[serde(alias = "singer_name")]
    pub entity_name: String,
    /// URL that retrieves the asset directly.
    #[serde(alias = "download_url")]
    pub download_reference: String,
    /// Size in bytes, when known.
    #[serde(default, alias = "file_size")]
    pub size_hint: Option<u64>,
    /// Duration as shown by the site, when known.
    #[serde(default, alias = "duration")]
    pub duration_hint: Option<String>,
}

impl Item {
    /// Folds a re-discovered record into this one.
    ///
    /// Non-empty incoming fields replace the stored ones; hints are filled but
    /// never cleared. Returns whether anything changed.
    pub fn absorb(&mut self, incoming: Item) -> bool {
        let before = self.clone();

        replace_if_present(&mut self.title, incoming.title);
        replace_if_present(&mut self.source_url, incoming.source_url);
        replace_if_present(&mut self.entity_id, incoming.entity_id);
        replace_if_present(&mut self.entity_name, incoming.entity_name);
        replace_if_present(&mut self.download_reference, incoming.download_reference);
        if incoming.size_hint.is_some() {
            self.size_hint = incoming.size_hint;
        }
        if incoming.duration_hint.is_some() {
            self.duration_hint = incoming.duration_hint;
        }

        *self != before
    }
}

fn replace_if_present(field: &mut String, incoming: String) {
    if !incoming.trim().is_empty() {
        *field = incoming;
    }
}

/// Aggregates derived from the full item collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStats {
    /// Number of stored items.
    pub total_items: usize,
    /// Number of distinct owning entities.
    pub total_entities: usize,
    /// Item count per entity name.
    pub items_per_entity: BTreeMap<String, usize>,
}

impl AggregateStats {
    /// Recomputes aggregates from the authoritative collection.
    #[must_use]
    pub fn from_items(items: &[Item]) -> Self {
        let mut items_per_entity = BTreeMap::new();
        let mut entity_ids = HashSet::new();
        for item in items {
            *items_per_entity.entry(item.entity_name.clone()).or_insert(0) += 1;
            entity_ids.insert(item.entity_id.as_str());
        }
        Self {
            total_items: items.len(),
            total_entities: entity_ids.len(),
            items_per_entity,
        }
    }
}
