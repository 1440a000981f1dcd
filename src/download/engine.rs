//! Download manager for concurrent, resumable item downloads.
//!
//! # Overview
//!
//! A batch runs in two phases:
//!
//! 1. **Planning** (no network): every item is checked against the skip rule.
//!    Items already on disk, or recorded in the download index within its
//!    TTL, are skipped. Each remaining item is given its own target path: an
//!    item whose name collides with an earlier item of the batch gets its id
//!    appended. The `limit` budget is spent only on the remaining items;
//!    anything beyond it is deferred.
//! 2. **Downloading**: a semaphore-bounded pool of tasks streams each item
//!    into `<target>.part` and renames it into place on success, so a reader
//!    never sees a half-written final file.
//!
//! Item failures are recorded in the [`DownloadReport`] and never abort the
//! batch. Only proxy pool exhaustion stops dispatch and fails the operation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use super::DownloadError;
use super::filename::{
    disambiguated_stem, existing_at_stem, partial_path, path_for_stem, target_stem,
};
use super::progress::{ProgressEvent, ProgressObserver};
use crate::error::{ErrorClass, Failure, HarvestError};
use crate::fetch::{FetchOptions, Fetcher, RetryDecision, RetryPolicy, classify_error};
use crate::policy::EffectivePolicy;
use crate::store::{DownloadIndex, DownloadRecord, Item, now};

/// Result of a download batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// Items downloaded in this batch.
    pub succeeded: Vec<String>,
    /// Items that satisfied the skip rule.
    pub skipped: Vec<String>,
    /// Items that failed terminally.
    pub failed: Vec<Failure>,
    /// Pending items beyond the limit budget, neither attempted nor failed.
    pub deferred: Vec<String>,
    /// Bytes written by successful downloads.
    pub bytes: u64,
}

impl DownloadReport {
    /// Items the batch looked at.
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.skipped.len() + self.failed.len() + self.deferred.len()
    }
}

/// A pending item and the file it will be written to.
struct Planned<'a> {
    item: &'a Item,
    target: PathBuf,
}

enum ItemOutcome {
    Downloaded { path: PathBuf, bytes: u64 },
    Failed(Failure),
    PoolExhausted,
}

/// Downloads item assets with bounded concurrency.
///
/// Each item goes through its own retry loop on top of the fetcher's
/// per-request retries: a fetch that exhausted its attempts is retried as a
/// whole after a backoff, as long as the failure was retryable.
#[derive(Debug, Clone)]
pub struct DownloadManager {
    fetcher: Arc<Fetcher>,
    index: Arc<DownloadIndex>,
    retry: RetryPolicy,
    workers: usize,
}

impl DownloadManager {
    /// Creates a manager sized by `policy`.
    #[must_use]
    pub fn new(fetcher: Arc<Fetcher>, index: Arc<DownloadIndex>, policy: &EffectivePolicy) -> Self {
        Self {
            fetcher,
            index,
            retry: policy.retry_limits.retry_policy(),
            workers: policy.max_workers.max(1),
        }
    }

    /// Returns the configured worker count.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Downloads `items` into `dir`.
    ///
    /// At most `limit` items are attempted; skipped items do not count
    /// against it. Progress is reported to `observer` as each item finishes.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::ProxyPoolExhausted`] when no egress is left.
    /// Files completed before that point stay on disk and in the index.
    #[instrument(skip(self, items, observer), fields(items = items.len(), dir = %dir.display(), workers = self.workers))]
    pub async fn download(
        &self,
        items: &[Item],
        dir: &Path,
        limit: Option<usize>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<DownloadReport, HarvestError> {
        let mut report = DownloadReport::default();
        let pending = self.plan(items, dir, &mut report).await;

        let budget = limit.unwrap_or(usize::MAX);
        let mut scheduled = Vec::with_capacity(pending.len().min(budget));
        for planned in pending {
            if scheduled.len() < budget {
                scheduled.push(planned);
            } else {
                report.deferred.push(planned.item.id.clone());
            }
        }

        let total = scheduled.len();
        info!(
            total,
            skipped = report.skipped.len(),
            deferred = report.deferred.len(),
            "starting downloads"
        );
        observer.on_start(total);

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let stop = Arc::new(AtomicBool::new(false));
        let completed = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(total);

        for Planned { item, target } in scheduled {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            if stop.load(Ordering::SeqCst) {
                break;
            }

            let manager = self.clone();
            let item = item.clone();
            let stop = Arc::clone(&stop);
            let completed = Arc::clone(&completed);
            let observer = Arc::clone(&observer);
            let item_id = item.id.clone();

            handles.push((
                item_id,
                tokio::spawn(async move {
                    let _permit = permit;
                    let outcome = manager.download_item(&item, &target).await;
                    if matches!(outcome, ItemOutcome::PoolExhausted) {
                        stop.store(true, Ordering::SeqCst);
                        return outcome;
                    }

                    let bytes = match &outcome {
                        ItemOutcome::Downloaded { bytes, .. } => Some(*bytes),
                        _ => None,
                    };
                    observer.on_item(&ProgressEvent {
                        completed: completed.fetch_add(1, Ordering::SeqCst) + 1,
                        total,
                        item_id: item.id.clone(),
                        bytes,
                    });
                    outcome
                }),
            ));
        }

        for (item_id, handle) in handles {
            match handle.await {
                Ok(ItemOutcome::Downloaded { path, bytes }) => {
                    debug!(item_id = %item_id, path = %path.display(), bytes, "download completed");
                    report.bytes += bytes;
                    report.succeeded.push(item_id);
                }
                Ok(ItemOutcome::Failed(failure)) => report.failed.push(failure),
                Ok(ItemOutcome::PoolExhausted) => {}
                Err(e) => {
                    warn!(item_id = %item_id, error = %e, "download task panicked");
                    report
                        .failed
                        .push(Failure::new(item_id, ErrorClass::Network, e));
                }
            }
        }
        observer.on_finish();

        if stop.load(Ordering::SeqCst) {
            warn!(
                succeeded = report.succeeded.len(),
                "proxy pool exhausted, downloads aborted"
            );
            return Err(HarvestError::pool_exhausted("download_items"));
        }

        info!(
            succeeded = report.succeeded.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            deferred = report.deferred.len(),
            bytes = report.bytes,
            "downloads finished"
        );
        Ok(report)
    }

    /// Applies the skip rule and assigns target paths; returns the items
    /// that still need downloading.
    ///
    /// Within a batch no two items share a target: the first item to claim a
    /// name keeps it, later ones fall back to [`disambiguated_stem`]. Repeated
    /// ids are planned once.
    async fn plan<'a>(
        &self,
        items: &'a [Item],
        dir: &Path,
        report: &mut DownloadReport,
    ) -> Vec<Planned<'a>> {
        let mut pending = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut claimed: HashSet<PathBuf> = HashSet::new();
        for item in items {
            if !seen.insert(item.id.as_str()) {
                debug!(item_id = %item.id, "duplicate item in batch, ignoring");
                continue;
            }
            if item.download_reference.trim().is_empty() {
                let error = DownloadError::MissingReference {
                    item_id: item.id.clone(),
                };
                warn!(item_id = %item.id, "item has no download reference");
                report
                    .failed
                    .push(Failure::new(item.id.clone(), error.class(), error));
                continue;
            }

            let mut stem = target_stem(dir, item);
            if claimed.contains(&stem) {
                stem = disambiguated_stem(dir, item);
                debug!(item_id = %item.id, stem = %stem.display(), "name collision, appending id");
            }
            claimed.insert(stem.clone());

            if let Some(path) = existing_at_stem(&stem).await {
                debug!(item_id = %item.id, path = %path.display(), "already on disk, skipping");
                if self.index.get(&item.id).await.is_none() {
                    self.record(item).await;
                }
                report.skipped.push(item.id.clone());
                continue;
            }

            if self.index.is_fresh(&item.id).await {
                debug!(item_id = %item.id, "recently downloaded, skipping");
                report.skipped.push(item.id.clone());
                continue;
            }

            pending.push(Planned {
                item,
                target: path_for_stem(&stem, item),
            });
        }
        pending
    }

    #[instrument(skip(self, item, target), fields(item_id = %item.id))]
    async fn download_item(&self, item: &Item, target: &Path) -> ItemOutcome {
        match self.download_with_retry(item, target).await {
            Ok((path, bytes)) => {
                self.record(item).await;
                ItemOutcome::Downloaded { path, bytes }
            }
            Err(e) if e.is_pool_exhausted() => ItemOutcome::PoolExhausted,
            Err(e) => {
                warn!(url = %item.download_reference, error = %e, "download failed");
                ItemOutcome::Failed(Failure::new(item.id.clone(), e.class(), e))
            }
        }
    }

    async fn download_with_retry(
        &self,
        item: &Item,
        target: &Path,
    ) -> Result<(PathBuf, u64), DownloadError> {
        let partial = partial_path(target);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::disk(parent, e))?;
        }

        // One fetch attempt per loop turn; this loop owns the attempt budget.
        let options = FetchOptions {
            referer: Some(item.source_url.clone()),
            max_attempts: Some(1),
        };
        let mut attempt = 1;

        loop {
            let error = match self
                .fetcher
                .fetch_to_file_with(&item.download_reference, &partial, &options)
                .await
            {
                Ok(bytes) => {
                    if let Err(e) = tokio::fs::rename(&partial, target).await {
                        let _ = tokio::fs::remove_file(&partial).await;
                        return Err(DownloadError::disk(target, e));
                    }
                    return Ok((target.to_path_buf(), bytes));
                }
                Err(e) => e,
            };
            if error.is_pool_exhausted() {
                return Err(error.into());
            }

            match self.retry.should_retry(classify_error(&error), attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "retrying download"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(attempt, reason = %reason, "not retrying download");
                    // Leftover from an attempt that failed outside the stream.
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Err(error.into());
                }
            }
        }
    }

    async fn record(&self, item: &Item) {
        let entry = DownloadRecord {
            ts: now(),
            entity_name: Some(item.entity_name.clone()),
            title: Some(item.title.clone()),
        };
        if let Err(e) = self.index.record(&item.id, entry).await {
            warn!(item_id = %item.id, error = %e, "failed to update download index");
        }
    }
}
