//! Per-entity listing crawler.
//!
//! Entities are crawled in parallel up to the policy's worker count; the pages
//! of one entity are walked sequentially. Each entity's items are merged into
//! the [`ItemStore`] as soon as that entity finishes, so a batch interrupted
//! halfway keeps everything collected so far.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use super::PageError;
use super::extract::{Extractor, Listing, dedup_longest};
use crate::error::{ErrorClass, Failure, HarvestError};
use crate::fetch::Fetcher;
use crate::policy::EffectivePolicy;
use crate::store::{AggregateStats, CrawlCache, Entity, Item, ItemStore, MergeCounts, now};

/// Result of an item crawl batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Items added to the store.
    pub inserted: usize,
    /// Stored items whose fields changed.
    pub updated: usize,
    /// Stored items seen again without changes.
    pub unchanged: usize,
    /// Entities crawled in this batch.
    pub crawled: Vec<String>,
    /// Entities skipped because the crawl cache marks them as recent.
    pub skipped_recent: Vec<String>,
    /// Entities or pages that failed.
    pub failures: Vec<Failure>,
    /// Aggregates of the whole store after the batch.
    pub stats: AggregateStats,
}

impl MergeReport {
    fn absorb_counts(&mut self, counts: &MergeCounts) {
        self.inserted += counts.inserted;
        self.updated += counts.updated;
        self.unchanged += counts.unchanged;
    }
}

enum EntityOutcome {
    SkippedRecent,
    Crawled {
        counts: MergeCounts,
        failures: Vec<Failure>,
        pool_exhausted: bool,
    },
    Failed(Failure),
    PoolExhausted,
}

/// Crawls entity listings and merges the items into the store.
#[derive(Clone)]
pub struct ItemCrawler {
    fetcher: Arc<Fetcher>,
    extractor: Arc<dyn Extractor>,
    store: Arc<ItemStore>,
    cache: Arc<CrawlCache>,
    workers: usize,
}

impl ItemCrawler {
    /// Creates a crawler sized by `policy`.
    #[must_use]
    pub fn new(
        fetcher: Arc<Fetcher>,
        extractor: Arc<dyn Extractor>,
        store: Arc<ItemStore>,
        cache: Arc<CrawlCache>,
        policy: &EffectivePolicy,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            store,
            cache,
            workers: policy.max_workers.max(1),
        }
    }

    /// Crawls every entity in `entities` and merges the results.
    ///
    /// Entities crawled within the cache TTL are skipped unless `force` is
    /// set. An entity is stamped in the crawl cache only when all of its pages
    /// succeeded; a partial crawl still merges what it found.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::ProxyPoolExhausted`] when no egress is left
    /// (items merged before that point stay in the store), or
    /// [`HarvestError::Store`] if the final aggregates cannot be read.
    #[instrument(skip(self, entities), fields(entities = entities.len(), workers = self.workers))]
    pub async fn crawl_items(
        &self,
        entities: &[Entity],
        force: bool,
    ) -> Result<MergeReport, HarvestError> {
        info!("starting item crawl");

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(entities.len());

        for entity in entities {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            if stop.load(Ordering::SeqCst) {
                break;
            }

            let crawler = self.clone();
            let stop = Arc::clone(&stop);
            let entity = entity.clone();
            let entity_id = entity.id.clone();
            handles.push((
                entity_id,
                tokio::spawn(async move {
                    let _permit = permit;
                    let outcome = crawler.crawl_entity(&entity, force).await;
                    if matches!(
                        outcome,
                        EntityOutcome::PoolExhausted
                            | EntityOutcome::Crawled {
                                pool_exhausted: true,
                                ..
                            }
                    ) {
                        stop.store(true, Ordering::SeqCst);
                    }
                    outcome
                }),
            ));
        }

        let mut report = MergeReport::default();
        for (entity_id, handle) in handles {
            match handle.await {
                Ok(EntityOutcome::SkippedRecent) => report.skipped_recent.push(entity_id),
                Ok(EntityOutcome::Crawled {
                    counts, failures, ..
                }) => {
                    report.absorb_counts(&counts);
                    report.failures.extend(failures);
                    report.crawled.push(entity_id);
                }
                Ok(EntityOutcome::Failed(failure)) => report.failures.push(failure),
                Ok(EntityOutcome::PoolExhausted) => {}
                Err(e) => {
                    warn!(entity_id = %entity_id, error = %e, "entity task panicked");
                    report
                        .failures
                        .push(Failure::new(entity_id, ErrorClass::Network, e));
                }
            }
        }

        if stop.load(Ordering::SeqCst) {
            warn!(
                crawled = report.crawled.len(),
                "proxy pool exhausted, item crawl aborted"
            );
            return Err(HarvestError::pool_exhausted("crawl_items"));
        }

        report.stats = self.store.stats().await?;
        info!(
            crawled = report.crawled.len(),
            skipped_recent = report.skipped_recent.len(),
            inserted = report.inserted,
            updated = report.updated,
            failures = report.failures.len(),
            total_items = report.stats.total_items,
            "item crawl finished"
        );
        Ok(report)
    }

    #[instrument(skip(self, entity), fields(entity_id = %entity.id))]
    async fn crawl_entity(&self, entity: &Entity, force: bool) -> EntityOutcome {
        if !force && self.cache.is_fresh(&entity.id).await {
            debug!("entity crawled recently, skipping");
            return EntityOutcome::SkippedRecent;
        }

        let (mut items, last_page) = match self.crawl_page(entity, 1).await {
            Ok(first) => first,
            Err(e) if e.is_pool_exhausted() => return EntityOutcome::PoolExhausted,
            Err(e) => {
                warn!(error = %e, "entity listing failed");
                return EntityOutcome::Failed(Failure::new(entity.id.clone(), e.class(), e));
            }
        };

        let mut failures = Vec::new();
        let mut pool_exhausted = false;
        for page_no in 2..=last_page {
            match self.crawl_page(entity, page_no).await {
                Ok((found, _)) => items.extend(found),
                Err(e) if e.is_pool_exhausted() => {
                    pool_exhausted = true;
                    break;
                }
                Err(e) => {
                    warn!(page = page_no, error = %e, "entity listing page failed");
                    failures.push(Failure::new(
                        format!("{} page {page_no}", entity.id),
                        e.class(),
                        e,
                    ));
                }
            }
        }

        let items = dedup_longest(items, |i| i.id.as_str(), |i| i.title.as_str());
        debug!(items = items.len(), pages = last_page, "entity listing collected");

        let counts = match self.store.merge(items).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(error = %e, "item store merge failed");
                return EntityOutcome::Failed(Failure::new(entity.id.clone(), e.class(), e));
            }
        };

        if failures.is_empty() && !pool_exhausted {
            if let Err(e) = self.cache.record(&entity.id, now()).await {
                warn!(error = %e, "failed to stamp crawl cache");
            }
        }

        EntityOutcome::Crawled {
            counts,
            failures,
            pool_exhausted,
        }
    }

    /// Fetches one listing page; returns its items and the last page number.
    async fn crawl_page(&self, entity: &Entity, page_no: u32) -> Result<(Vec<Item>, u32), PageError> {
        let url = self.extractor.entity_page_url(entity, page_no);
        let body = self.fetcher.fetch_page(&url).await?;
        let items = self.extractor.items(&body, entity)?;
        let last_page = self
            .extractor
            .max_page(&body, Listing::Entity(entity))
            .unwrap_or(page_no)
            .max(page_no);
        Ok((items, last_page))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::crawl::{RegexExtractor, SiteLayout};
    use crate::policy::{DelayRange, Mode, Overrides, PolicyResolver, ProxyUsage};
    use crate::proxy::ProxyPool;
    use crate::store::CRAWL_CACHE_SECTION;

    fn policy() -> EffectivePolicy {
        PolicyResolver::new(4, Duration::from_secs(5), Duration::from_secs(30))
            .unwrap()
            .resolve(
                Mode::Throughput,
                &Overrides {
                    max_attempts: Some(1),
                    request_delay: Some(DelayRange::ZERO),
                    retry_jitter: Some(Duration::ZERO),
                    proxy_usage: Some(ProxyUsage::Direct),
                    ..Overrides::default()
                },
            )
            .unwrap()
    }

    fn crawler(base: &str, dir: &TempDir, cache: Arc<CrawlCache>) -> ItemCrawler {
        let policy = policy();
        let fetcher = Arc::new(Fetcher::new(Arc::new(ProxyPool::direct()), &policy));
        let extractor = Arc::new(RegexExtractor::new(SiteLayout::new(base)).unwrap());
        let store = Arc::new(ItemStore::new(dir.path().join("songs.json")));
        ItemCrawler::new(fetcher, extractor, store, cache, &policy)
    }

    fn entity(base: &str, id: &str) -> Entity {
        Entity {
            id: id.to_string(),
            name: format!("Singer {id}"),
            url: format!("{base}/singer/{id}/1.html"),
            base_url: format!("{base}/singer/{id}"),
        }
    }

    // ==================== crawl_items Tests ====================

    #[tokio::test]
    async fn test_crawls_all_pages_and_stamps_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/singer/7/1.html"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<a href="/mp3/aa.html">One</a><a href="/singer/7/2.html">2</a>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/singer/7/2.html"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<a href="/mp3/bb.html">Two</a><a href="/mp3/aa.html">One (Live)</a>"#,
            ))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let cache = Arc::new(CrawlCache::in_memory(CRAWL_CACHE_SECTION, 7));
        let crawler = crawler(&server.uri(), &dir, Arc::clone(&cache));

        let report = crawler
            .crawl_items(&[entity(&server.uri(), "7")], false)
            .await
            .unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(report.crawled, vec!["7".to_string()]);
        assert!(report.failures.is_empty());
        assert_eq!(report.stats.total_items, 2);
        assert!(cache.is_fresh("7").await);

        let doc = crawler.store.load().await.unwrap();
        let one = doc.items.iter().find(|i| i.id == "aa").unwrap();
        assert_eq!(one.title, "One (Live)");
    }

    #[tokio::test]
    async fn test_recent_entity_is_skipped_without_fetching() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let cache = Arc::new(CrawlCache::in_memory(CRAWL_CACHE_SECTION, 7));
        cache.record("7", now()).await.unwrap();
        let crawler = crawler(&server.uri(), &dir, cache);

        let report = crawler
            .crawl_items(&[entity(&server.uri(), "7")], false)
            .await
            .unwrap();

        assert_eq!(report.skipped_recent, vec!["7".to_string()]);
        assert!(report.crawled.is_empty());
    }

    #[tokio::test]
    async fn test_failed_page_is_reported_and_cache_not_stamped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/singer/7/1.html"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<a href="/mp3/aa.html">One</a><a href="/singer/7/2.html">2</a>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/singer/7/2.html"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let cache = Arc::new(CrawlCache::in_memory(CRAWL_CACHE_SECTION, 7));
        let crawler = crawler(&server.uri(), &dir, Arc::clone(&cache));

        let report = crawler
            .crawl_items(&[entity(&server.uri(), "7")], false)
            .await
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].unit, "7 page 2");
        assert!(!cache.is_fresh("7").await);
    }

    #[tokio::test]
    async fn test_one_failed_entity_does_not_stop_others() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/singer/1/1.html"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/singer/2/1.html"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"<a href="/mp3/cc.html">Three</a>"#),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let cache = Arc::new(CrawlCache::in_memory(CRAWL_CACHE_SECTION, 7));
        let crawler = crawler(&server.uri(), &dir, cache);
        let base = server.uri();

        let report = crawler
            .crawl_items(&[entity(&base, "1"), entity(&base, "2")], false)
            .await
            .unwrap();

        assert_eq!(report.crawled, vec!["2".to_string()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].unit, "1");
        assert_eq!(report.stats.total_items, 1);
    }
}
