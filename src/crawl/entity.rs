//! Entity catalog crawler.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{StreamExt, stream};
use tracing::{debug, info, instrument, warn};

use super::extract::{Extractor, Listing};
use super::PageError;
use crate::error::{Failure, HarvestError};
use crate::fetch::Fetcher;
use crate::policy::EffectivePolicy;
use crate::store::Entity;

/// Case-insensitive keyword filter on entity names.
///
/// An entity is kept when any keyword is a substring of its name. An empty
/// filter keeps everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameFilter {
    keywords: Vec<String>,
}

impl NameFilter {
    /// Builds a filter from keywords. Blank keywords are ignored.
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// A filter that keeps every entity.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Whether the filter has no keywords.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    /// Whether `name` passes the filter.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        if self.keywords.is_empty() {
            return true;
        }
        let name = name.to_lowercase();
        self.keywords.iter().any(|k| name.contains(k.as_str()))
    }
}

/// Result of a catalog crawl.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlReport {
    /// Entities that passed the filter, deduplicated by id.
    pub entities: Vec<Entity>,
    /// Catalog pages fetched and extracted successfully.
    pub pages_crawled: usize,
    /// Pages that failed.
    pub failures: Vec<Failure>,
    /// Last catalog page announced by the first page's pagination.
    pub last_page: Option<u32>,
}

struct CatalogPage {
    entities: Vec<Entity>,
    last_page: Option<u32>,
}

/// Accumulates entities across pages.
#[derive(Default)]
struct Collector {
    entities: Vec<Entity>,
    index: HashMap<String, usize>,
    pages_crawled: usize,
    failures: Vec<Failure>,
    pool_exhausted: bool,
}

impl Collector {
    fn absorb(&mut self, found: Vec<Entity>, filter: &NameFilter) {
        self.pages_crawled += 1;
        for entity in found {
            if !filter.matches(&entity.name) {
                continue;
            }
            match self.index.get(&entity.id) {
                Some(&pos) => {
                    if entity.name.chars().count() > self.entities[pos].name.chars().count() {
                        self.entities[pos] = entity;
                    }
                }
                None => {
                    self.index.insert(entity.id.clone(), self.entities.len());
                    self.entities.push(entity);
                }
            }
        }
    }

    fn record_failure(&mut self, page_no: u32, error: &PageError) {
        if error.is_pool_exhausted() {
            self.pool_exhausted = true;
            return;
        }
        warn!(page = page_no, error = %error, "catalog page failed");
        self.failures
            .push(Failure::new(format!("page {page_no}"), error.class(), error));
    }

    fn limit_reached(&self, limit: Option<usize>) -> bool {
        limit.is_some_and(|limit| self.entities.len() >= limit)
    }
}

/// Outcome of one window of pages in open-ended mode.
struct PassOutcome {
    saw_empty_page: bool,
    any_succeeded: bool,
}

/// Paginates the entity catalog with a bounded worker pool.
pub struct EntityCrawler {
    fetcher: Arc<Fetcher>,
    extractor: Arc<dyn Extractor>,
    workers: usize,
}

impl EntityCrawler {
    /// Creates a crawler sized by `policy`.
    #[must_use]
    pub fn new(
        fetcher: Arc<Fetcher>,
        extractor: Arc<dyn Extractor>,
        policy: &EffectivePolicy,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            workers: policy.max_workers.max(1),
        }
    }

    /// Crawls the catalog from page 1.
    ///
    /// # Errors
    ///
    /// See [`crawl_entities_from`](Self::crawl_entities_from).
    pub async fn crawl_entities(
        &self,
        filter: &NameFilter,
        limit: Option<usize>,
    ) -> Result<CrawlReport, HarvestError> {
        self.crawl_entities_from(1, filter, limit).await
    }

    /// Crawls the catalog starting at `start_page`.
    ///
    /// The first page announces the last page number; the remaining pages are
    /// fetched concurrently. Without a pagination hint, pages are fetched in
    /// windows of `max_workers` until a page yields no entities. Once `limit`
    /// matching entities are collected no new page is started; pages already
    /// in flight still complete and the result is truncated to `limit`.
    ///
    /// Page failures are recorded in the report and do not stop the crawl.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::ProxyPoolExhausted`] when no egress is left.
    #[instrument(skip(self, filter), fields(workers = self.workers))]
    pub async fn crawl_entities_from(
        &self,
        start_page: u32,
        filter: &NameFilter,
        limit: Option<usize>,
    ) -> Result<CrawlReport, HarvestError> {
        let start_page = start_page.max(1);
        info!(start_page, keywords = !filter.is_empty(), "starting catalog crawl");

        let mut collector = Collector::default();
        let done = AtomicBool::new(false);

        let (last_page, first_empty) = match self.crawl_page(start_page).await {
            Ok(page) => {
                debug!(
                    page = start_page,
                    found = page.entities.len(),
                    last_page = ?page.last_page,
                    "catalog page crawled"
                );
                let first_empty = page.entities.is_empty();
                collector.absorb(page.entities, filter);
                (page.last_page, first_empty)
            }
            Err(e) => {
                collector.record_failure(start_page, &e);
                if collector.pool_exhausted {
                    return Err(HarvestError::pool_exhausted("crawl_entities"));
                }
                return Ok(finish(collector, None, limit));
            }
        };

        if !collector.limit_reached(limit) && !(first_empty && last_page.is_none()) {
            match last_page {
                Some(last) => {
                    let pages: Vec<u32> = (start_page + 1..=last).collect();
                    self.run_pages(pages, &mut collector, filter, limit, &done)
                        .await;
                }
                None => {
                    let window = u32::try_from(self.workers).unwrap_or(u32::MAX);
                    let mut next = start_page + 1;
                    loop {
                        let pages: Vec<u32> = (next..next.saturating_add(window)).collect();
                        next = next.saturating_add(window);
                        let outcome = self
                            .run_pages(pages, &mut collector, filter, limit, &done)
                            .await;
                        if done.load(Ordering::SeqCst)
                            || outcome.saw_empty_page
                            || !outcome.any_succeeded
                        {
                            break;
                        }
                    }
                }
            }
        }

        if collector.pool_exhausted {
            return Err(HarvestError::pool_exhausted("crawl_entities"));
        }
        Ok(finish(collector, last_page, limit))
    }

    async fn run_pages(
        &self,
        pages: Vec<u32>,
        collector: &mut Collector,
        filter: &NameFilter,
        limit: Option<usize>,
        done: &AtomicBool,
    ) -> PassOutcome {
        let mut outcome = PassOutcome {
            saw_empty_page: false,
            any_succeeded: false,
        };

        let mut results = stream::iter(pages)
            .map(|page_no| async move {
                if done.load(Ordering::SeqCst) {
                    return (page_no, None);
                }
                (page_no, Some(self.crawl_page(page_no).await))
            })
            .buffer_unordered(self.workers);

        while let Some((page_no, result)) = results.next().await {
            match result {
                None => {}
                Some(Ok(page)) => {
                    debug!(page = page_no, found = page.entities.len(), "catalog page crawled");
                    outcome.any_succeeded = true;
                    outcome.saw_empty_page |= page.entities.is_empty();
                    collector.absorb(page.entities, filter);
                }
                Some(Err(e)) => {
                    collector.record_failure(page_no, &e);
                    if collector.pool_exhausted {
                        done.store(true, Ordering::SeqCst);
                    }
                }
            }
            if collector.limit_reached(limit) {
                done.store(true, Ordering::SeqCst);
            }
        }
        outcome
    }

    #[instrument(skip(self))]
    async fn crawl_page(&self, page_no: u32) -> Result<CatalogPage, PageError> {
        let url = self.extractor.catalog_url(page_no);
        let body = self.fetcher.fetch_page(&url).await?;
        let entities = self.extractor.entities(&body)?;
        let last_page = self.extractor.max_page(&body, Listing::Catalog);
        Ok(CatalogPage {
            entities,
            last_page,
        })
    }
}

fn finish(collector: Collector, last_page: Option<u32>, limit: Option<usize>) -> CrawlReport {
    let mut entities = collector.entities;
    if let Some(limit) = limit {
        entities.truncate(limit);
    }
    info!(
        entities = entities.len(),
        pages = collector.pages_crawled,
        failures = collector.failures.len(),
        "catalog crawl finished"
    );
    CrawlReport {
        entities,
        pages_crawled: collector.pages_crawled,
        failures: collector.failures,
        last_page,
    }
}
