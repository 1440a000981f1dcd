//! Operation entry points used by front ends.
//!
//! [`Harvester`] wires configuration, policy, the proxy pool, the stores, and
//! the crawlers together. Every operation resolves its own
//! [`EffectivePolicy`], so the download worker count and the crawler worker
//! count stay independent.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::{AppConfig, ConfigError};
use crate::crawl::{
    CrawlReport, EntityCrawler, Extractor, ItemCrawler, MergeReport, NameFilter, RegexExtractor,
    SiteLayout,
};
use crate::download::{DownloadManager, DownloadReport, ProgressObserver};
use crate::error::{ErrorClass, Failure, HarvestError};
use crate::fetch::Fetcher;
use crate::policy::{EffectivePolicy, Mode, Overrides, PolicyResolver, ProxyUsage};
use crate::proxy::{PoolStatus, ProxyPool};
use crate::store::{
    AggregateStats, CRAWL_CACHE_SECTION, CrawlCache, DOWNLOAD_INDEX_SECTION, DownloadIndex,
    Entity, EntityStore, Item, ItemStore,
};

/// Process-wide options layered over the config file.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Forces the cautious posture on or off; `None` defers to config.
    pub safe_mode: Option<bool>,
    /// Sends every request directly, bypassing the proxy pool.
    pub no_proxy: bool,
    /// Worker count override for every operation.
    pub workers: Option<usize>,
}

/// The crawl-and-download engine behind every front end.
pub struct Harvester {
    config: AppConfig,
    options: RunOptions,
    resolver: PolicyResolver,
    pool: Arc<ProxyPool>,
    extractor: Arc<dyn Extractor>,
    entities: Arc<EntityStore>,
    items: Arc<ItemStore>,
}

impl Harvester {
    /// Builds a harvester for the site and proxy sources in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Config`] if the config is invalid.
    pub fn new(config: AppConfig, options: RunOptions) -> Result<Self, HarvestError> {
        config.validate()?;
        let extractor = RegexExtractor::new(SiteLayout::new(config.site_root()))
            .map_err(|e| ConfigError::invalid("base_url", e, "a usable site layout"))?;
        let pool = Arc::new(ProxyPool::from_config(&config));
        Self::with_parts(config, options, pool, Arc::new(extractor))
    }

    /// Builds a harvester around an existing pool and extractor.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Config`] if the config is invalid.
    pub fn with_parts(
        config: AppConfig,
        options: RunOptions,
        pool: Arc<ProxyPool>,
        extractor: Arc<dyn Extractor>,
    ) -> Result<Self, HarvestError> {
        config.validate()?;
        let resolver = PolicyResolver::from_config(&config)?;
        Ok(Self {
            entities: Arc::new(EntityStore::new(&config.entities_file)),
            items: Arc::new(ItemStore::new(&config.items_file)),
            config,
            options,
            resolver,
            pool,
            extractor,
        })
    }

    /// Returns the loaded configuration.
    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Returns the shared proxy pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    /// Posture selected by the run options, falling back to config.
    #[must_use]
    pub fn mode(&self) -> Mode {
        Mode::from_safe_mode(
            self.options
                .safe_mode
                .unwrap_or(self.config.safe_mode_enabled),
        )
    }

    /// Egress selection: direct when proxies are disabled in config or for
    /// this run.
    #[must_use]
    pub fn proxy_usage(&self) -> ProxyUsage {
        if self.options.no_proxy || !self.config.proxy_enabled {
            ProxyUsage::Direct
        } else {
            ProxyUsage::Rotate
        }
    }

    /// Resolves the policy for one operation.
    ///
    /// The worker count is, in order of precedence: the call's `concurrency`,
    /// the run's `--workers`, then `configured`.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Config`] if resolution fails.
    pub fn policy(
        &self,
        configured: usize,
        concurrency: Option<usize>,
    ) -> Result<EffectivePolicy, HarvestError> {
        let overrides = Overrides {
            max_workers: Some(concurrency.or(self.options.workers).unwrap_or(configured)),
            proxy_usage: Some(self.proxy_usage()),
            ..Overrides::default()
        };
        Ok(self.resolver.resolve(self.mode(), &overrides)?)
    }

    fn fetcher(&self, policy: &EffectivePolicy) -> Arc<Fetcher> {
        Arc::new(Fetcher::new(Arc::clone(&self.pool), policy))
    }

    /// Crawls the entity catalog from `start_page` and merges the matching
    /// entities into the entity store.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError`] on pool exhaustion or store failure.
    #[instrument(skip(self, filter))]
    pub async fn crawl_entities(
        &self,
        filter: &NameFilter,
        limit: Option<usize>,
        start_page: u32,
    ) -> Result<CrawlReport, HarvestError> {
        let policy = self.policy(self.config.crawler_max_workers, None)?;
        let crawler = EntityCrawler::new(self.fetcher(&policy), Arc::clone(&self.extractor), &policy);
        let report = crawler
            .crawl_entities_from(start_page, filter, limit)
            .await?;

        let added = self.entities.merge(&report.entities).await?;
        info!(
            found = report.entities.len(),
            added,
            path = %self.entities.path().display(),
            "entity store updated"
        );
        Ok(report)
    }

    /// Crawls the listings of `entity_ids` (every stored entity when empty)
    /// and merges the items into the item store.
    ///
    /// Only entities whose name passes `singers` are crawled, at most `limit`
    /// of them. Ids missing from the entity store are reported as failures.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError`] on pool exhaustion or store failure.
    #[instrument(skip(self, entity_ids, singers), fields(requested = entity_ids.len()))]
    pub async fn crawl_items(
        &self,
        entity_ids: &[String],
        singers: &NameFilter,
        limit: Option<usize>,
        concurrency: Option<usize>,
        force: bool,
    ) -> Result<MergeReport, HarvestError> {
        let known = self.entities.load().await?;
        let (mut selected, unknown) = select(known, entity_ids, |e: &Entity| e.id.as_str());
        keep_singers(&mut selected, singers, |e: &Entity| e.name.as_str());
        if let Some(limit) = limit {
            selected.truncate(limit);
        }

        let policy = self.policy(self.config.crawler_max_workers, concurrency)?;
        let cache = CrawlCache::open(
            &self.config.crawl_cache_file,
            CRAWL_CACHE_SECTION,
            self.config.singer_crawl_cache_days,
        )
        .await;
        let crawler = ItemCrawler::new(
            self.fetcher(&policy),
            Arc::clone(&self.extractor),
            Arc::clone(&self.items),
            Arc::new(cache),
            &policy,
        );

        let mut report = crawler.crawl_items(&selected, force).await?;
        report
            .failures
            .extend(unknown.into_iter().map(|id| unknown_failure(id, "entity")));
        Ok(report)
    }

    /// Downloads `item_ids` (every stored item when empty) into `dir`, or the
    /// configured download directory.
    ///
    /// Only items whose singer name passes `singers` are considered. `limit`
    /// defaults to `download_limit` from config.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError`] on pool exhaustion or store failure.
    #[instrument(skip(self, item_ids, singers, observer), fields(requested = item_ids.len()))]
    pub async fn download_items(
        &self,
        item_ids: &[String],
        singers: &NameFilter,
        dir: Option<&Path>,
        concurrency: Option<usize>,
        limit: Option<usize>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<DownloadReport, HarvestError> {
        let doc = self.items.load().await?;
        let (mut selected, unknown) = select(doc.items, item_ids, |i: &Item| i.id.as_str());
        keep_singers(&mut selected, singers, |i: &Item| i.entity_name.as_str());

        let policy = self.policy(self.config.download_max_workers, concurrency)?;
        let index = DownloadIndex::open(
            &self.config.download_index_file,
            DOWNLOAD_INDEX_SECTION,
            self.config.downloaded_cache_days,
        )
        .await;
        let manager = DownloadManager::new(self.fetcher(&policy), Arc::new(index), &policy);

        let dir = dir.unwrap_or(self.config.download_dir.as_path());
        let limit = limit.unwrap_or(self.config.download_limit);
        let mut report = manager
            .download(&selected, dir, Some(limit), observer)
            .await?;
        report
            .failed
            .extend(unknown.into_iter().map(|id| unknown_failure(id, "item")));
        Ok(report)
    }

    /// Aggregates recomputed from the item store.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Store`] if the item store cannot be read.
    pub async fn stats(&self) -> Result<AggregateStats, HarvestError> {
        Ok(self.items.stats().await?)
    }

    /// Entities in the entity store.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Store`] if the entity store cannot be read.
    pub async fn entities(&self) -> Result<Vec<Entity>, HarvestError> {
        Ok(self.entities.load().await?)
    }

    /// Probes every proxy source and returns the resulting pool status.
    pub async fn refresh_proxies(&self) -> PoolStatus {
        let admitted = self.pool.refill().await;
        let status = self.pool.status().await;
        if admitted == 0 {
            warn!("no proxy passed the health probe");
        }
        info!(admitted, live = status.live, "proxy pool refreshed");
        status
    }
}

/// Splits `records` into the ones named by `ids` and the ids not found.
/// An empty `ids` selects everything.
fn select<T>(
    records: Vec<T>,
    ids: &[String],
    id_of: impl Fn(&T) -> &str,
) -> (Vec<T>, Vec<String>) {
    if ids.is_empty() {
        return (records, Vec::new());
    }
    let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let selected: Vec<T> = records
        .into_iter()
        .filter(|r| wanted.contains(id_of(r)))
        .collect();
    let found: HashSet<&str> = selected.iter().map(&id_of).collect();

    let mut seen = HashSet::new();
    let unknown = ids
        .iter()
        .filter(|id| !found.contains(id.as_str()) && seen.insert(id.as_str()))
        .cloned()
        .collect();
    (selected, unknown)
}

/// Drops the records whose singer name fails `singers`.
fn keep_singers<T>(records: &mut Vec<T>, singers: &NameFilter, name_of: impl Fn(&T) -> &str) {
    if singers.is_empty() {
        return;
    }
    let before = records.len();
    records.retain(|r| singers.matches(name_of(r)));
    debug!(kept = records.len(), dropped = before - records.len(), "applied singer filter");
}

fn unknown_failure(id: String, kind: &str) -> Failure {
    warn!(id = %id, kind, "unknown id requested");
    Failure::new(id, ErrorClass::Config, format!("unknown {kind} id"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn harvester(config: AppConfig, options: RunOptions) -> Harvester {
        let extractor = Arc::new(RegexExtractor::new(SiteLayout::new(&config.base_url)).unwrap());
        Harvester::with_parts(config, options, Arc::new(ProxyPool::direct()), extractor).unwrap()
    }

    fn config_in(dir: &TempDir) -> AppConfig {
        AppConfig {
            entities_file: dir.path().join("singers.json"),
            items_file: dir.path().join("songs.json"),
            crawl_cache_file: dir.path().join("crawl_cache.json"),
            download_index_file: dir.path().join("downloaded_cache.json"),
            ..AppConfig::default()
        }
    }

    // ==================== Policy Tests ====================

    #[test]
    fn test_policy_precedence() {
        let dir = TempDir::new().unwrap();
        let h = harvester(
            config_in(&dir),
            RunOptions {
                workers: Some(6),
                ..RunOptions::default()
            },
        );

        assert_eq!(h.policy(3, None).unwrap().max_workers, 6);
        assert_eq!(h.policy(3, Some(2)).unwrap().max_workers, 2);
    }

    #[test]
    fn test_safe_mode_option_overrides_config() {
        let dir = TempDir::new().unwrap();
        let h = harvester(
            config_in(&dir),
            RunOptions {
                safe_mode: Some(true),
                workers: Some(8),
                ..RunOptions::default()
            },
        );

        assert_eq!(h.mode(), Mode::Cautious);
        assert_eq!(h.policy(3, Some(8)).unwrap().max_workers, 1);
    }

    #[test]
    fn test_proxy_usage_direct_when_disabled() {
        let dir = TempDir::new().unwrap();
        let h = harvester(config_in(&dir), RunOptions::default());
        assert_eq!(h.proxy_usage(), ProxyUsage::Rotate);

        let h = harvester(
            config_in(&dir),
            RunOptions {
                no_proxy: true,
                ..RunOptions::default()
            },
        );
        assert_eq!(h.proxy_usage(), ProxyUsage::Direct);

        let config = AppConfig {
            proxy_enabled: false,
            ..config_in(&dir)
        };
        assert_eq!(harvester(config, RunOptions::default()).proxy_usage(), ProxyUsage::Direct);
    }

    // ==================== Selection Tests ====================

    #[test]
    fn test_select_all_when_no_ids() {
        let (selected, unknown) = select(vec!["a", "b"], &[], |s: &&str| *s);
        assert_eq!(selected, vec!["a", "b"]);
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_select_reports_unknown_once() {
        let ids = vec!["b".to_string(), "x".to_string(), "x".to_string()];
        let (selected, unknown) = select(vec!["a", "b"], &ids, |s: &&str| *s);
        assert_eq!(selected, vec!["b"]);
        assert_eq!(unknown, vec!["x".to_string()]);
    }

    #[test]
    fn test_keep_singers_matches_name_substring() {
        let mut names = vec!["Jay Chou", "Faye Wong", "Jay Park"];
        keep_singers(&mut names, &NameFilter::new(["JAY"]), |s: &&str| *s);
        assert_eq!(names, vec!["Jay Chou", "Jay Park"]);

        let mut names = vec!["Jay Chou", "Faye Wong"];
        keep_singers(&mut names, &NameFilter::any(), |s: &&str| *s);
        assert_eq!(names.len(), 2);
    }

    // ==================== Stats Tests ====================

    #[tokio::test]
    async fn test_stats_on_empty_store() {
        let dir = TempDir::new().unwrap();
        let h = harvester(config_in(&dir), RunOptions::default());
        let stats = h.stats().await.unwrap();
        assert_eq!(stats.total_items, 0);
        assert!(h.entities().await.unwrap().is_empty());
    }
}
