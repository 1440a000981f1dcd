//! Proxy pool with health probing, weighted selection, and quarantine.
//!
//! The pool owns two sets: a live set that [`ProxyPool::acquire`] selects
//! from, and a cold set of quarantined proxies. All of it sits behind a single
//! lock; [`ProxyPool::acquire`] and [`ProxyPool::release`] are the mutation
//! points used by workers, while refills and re-probes run their network
//! checks outside the lock and only take it to commit results.
//!
//! # Lifecycle of a proxy
//!
//! 1. A [`ProxySource`] yields it as a candidate.
//! 2. A [`HealthProbe`] must pass before it enters the live set.
//! 3. Each reported [`Outcome::Failure`] increments its failure counter and
//!    [`Outcome::Success`] resets it.
//! 4. Reaching the failure threshold moves it to quarantine.
//! 5. Quarantined proxies older than the re-probe interval are probed again
//!    and return to the live set on success.

mod probe;
mod source;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use rand::distributions::{Distribution, WeightedIndex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub use probe::{HealthProbe, HttpProbe};
pub use source::{CachedSource, JsonApiSource, ManualListSource, ProxySource, parse_proxy_line};

use crate::config::AppConfig;
use crate::error::ErrorClass;
use crate::store::{StoreError, write_json_atomic};

/// Errors raised by the proxy pool and its sources.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No live proxy is left and direct connections are disabled.
    #[error("no live proxies available and direct fallback is disabled")]
    Exhausted,

    /// A proxy list file could not be read.
    #[error("failed to read proxy list {path}: {source}")]
    Io {
        /// List path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A remote or cached source returned unusable data.
    #[error("proxy source {name} failed: {reason}")]
    Source {
        /// Source name.
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// Persisting the live set failed.
    #[error("failed to persist proxy set: {0}")]
    Persist(#[from] StoreError),
}

impl ProxyError {
    /// Creates a source error.
    pub fn source_failed(name: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Source {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns the taxonomy class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Exhausted | Self::Source { .. } => ErrorClass::Network,
            Self::Io { .. } | Self::Persist(_) => ErrorClass::Disk,
        }
    }
}

/// Proxy protocol, used as the scheme of the proxy URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain HTTP proxy (CONNECT for TLS targets).
    Http,
    /// HTTPS proxy.
    Https,
    /// SOCKS5 proxy.
    Socks5,
}

impl Protocol {
    /// Returns the URL scheme for this protocol.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "socks5" | "socks5h" => Ok(Self::Socks5),
            other => Err(format!("unsupported proxy protocol: {other}")),
        }
    }
}

/// A candidate or admitted proxy and its health counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRecord {
    /// `host:port`, the identity of the proxy.
    pub address: String,
    /// Protocol used to reach it.
    pub protocol: Protocol,
    /// Failures reported since the last success.
    #[serde(default)]
    pub consecutive_failures: u32,
    /// When the proxy was last handed out.
    #[serde(skip)]
    pub last_used_at: Option<Instant>,
    /// Whether the proxy sits in the cold set.
    #[serde(default)]
    pub is_quarantined: bool,
    #[serde(skip)]
    quarantined_at: Option<Instant>,
}

impl ProxyRecord {
    /// Creates a fresh record with clean counters.
    pub fn new(address: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            address: address.into(),
            protocol,
            consecutive_failures: 0,
            last_used_at: None,
            is_quarantined: false,
            quarantined_at: None,
        }
    }

    /// Proxy URL suitable for `reqwest::Proxy::all`.
    #[must_use]
    pub fn url(&self) -> String {
        format!("{}://{}", self.protocol, self.address)
    }

    /// Handle that refers to this proxy.
    #[must_use]
    pub fn handle(&self) -> ProxyHandle {
        ProxyHandle::Proxy {
            address: self.address.clone(),
            protocol: self.protocol,
        }
    }

    fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.is_quarantined = false;
        self.quarantined_at = None;
    }

    fn quarantine(&mut self) {
        self.is_quarantined = true;
        self.quarantined_at = Some(Instant::now());
    }
}

/// The egress chosen for one request attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProxyHandle {
    /// Connect without a proxy.
    Direct,
    /// Connect through the named proxy.
    Proxy {
        /// `host:port` of the proxy.
        address: String,
        /// Protocol used to reach it.
        protocol: Protocol,
    },
}

impl ProxyHandle {
    /// Proxy URL, or `None` for direct connections.
    #[must_use]
    pub fn proxy_url(&self) -> Option<String> {
        match self {
            Self::Direct => None,
            Self::Proxy { address, protocol } => Some(format!("{protocol}://{address}")),
        }
    }

    /// Whether this is the direct-connection sentinel.
    #[must_use]
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct)
    }
}

impl fmt::Display for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Proxy { address, .. } => f.write_str(address),
        }
    }
}

/// Result of using a proxy, reported back through [`ProxyPool::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The request went through; resets the failure counter.
    Success,
    /// Connection failure, timeout, or block attributable to the proxy.
    Failure,
}

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Consecutive failures that quarantine a proxy.
    pub failure_threshold: u32,
    /// Minimum quarantine age before a re-probe, also the minimum spacing of
    /// automatic refills.
    pub reprobe_interval: Duration,
    /// Concurrent health probes.
    pub probe_concurrency: usize,
    /// Hand out [`ProxyHandle::Direct`] instead of failing when empty.
    pub allow_direct: bool,
    /// Where the live set is saved after a refill.
    pub persist_path: Option<PathBuf>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reprobe_interval: Duration::from_secs(300),
            probe_concurrency: 20,
            allow_direct: true,
            persist_path: None,
        }
    }
}

impl PoolSettings {
    /// Derives settings from application config.
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            failure_threshold: config.proxy.failure_threshold,
            reprobe_interval: Duration::from_secs(config.proxy.reprobe_interval_secs),
            probe_concurrency: config.proxy.probe_concurrency,
            allow_direct: config.proxy.allow_direct_fallback,
            persist_path: Some(config.proxy.cache_file.clone()),
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Proxies available for selection.
    pub live: usize,
    /// Proxies waiting for a re-probe.
    pub quarantined: usize,
    /// Whether an empty pool falls back to direct connections.
    pub allow_direct: bool,
}

#[derive(Debug, Default)]
struct PoolState {
    live: Vec<ProxyRecord>,
    quarantined: Vec<ProxyRecord>,
    last_refill: Option<Instant>,
    last_reprobe: Option<Instant>,
}

/// Probe used by pools without sources; admits nothing.
struct RejectAll;

#[async_trait]
impl HealthProbe for RejectAll {
    async fn check(&self, _record: &ProxyRecord) -> bool {
        false
    }
}

/// Shared pool of egress proxies.
///
/// Wrap it in `Arc` and hand clones to every fetcher.
pub struct ProxyPool {
    state: Mutex<PoolState>,
    // Serializes refills so concurrent empty-pool callers probe once.
    refill_lock: Mutex<()>,
    sources: Vec<Box<dyn ProxySource>>,
    probe: Arc<dyn HealthProbe>,
    settings: PoolSettings,
}

impl fmt::Debug for ProxyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyPool")
            .field("sources", &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ProxyPool {
    /// Creates an empty pool. Proxies are admitted by the first refill.
    #[must_use]
    pub fn new(
        sources: Vec<Box<dyn ProxySource>>,
        probe: Arc<dyn HealthProbe>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            refill_lock: Mutex::new(()),
            sources,
            probe,
            settings,
        }
    }

    /// Creates a pool with no sources that always yields direct connections.
    #[must_use]
    pub fn direct() -> Self {
        Self::new(Vec::new(), Arc::new(RejectAll), PoolSettings::default())
    }

    /// Builds the pool described by `config`: the cached live set, the manual
    /// list, and every configured API source, probed against the site root.
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        let probe_timeout = Duration::from_secs(config.proxy.probe_timeout_secs);
        let mut sources: Vec<Box<dyn ProxySource>> = vec![
            Box::new(CachedSource::new(&config.proxy.cache_file)),
            Box::new(ManualListSource::new(&config.proxy.manual_list)),
        ];
        for url in &config.proxy.api_sources {
            sources.push(Box::new(JsonApiSource::new(
                url.clone(),
                config.proxy.api_max_candidates,
                probe_timeout,
            )));
        }
        let probe = Arc::new(HttpProbe::new(config.probe_url(), probe_timeout));
        Self::new(sources, probe, PoolSettings::from_config(config))
    }

    /// Returns the pool settings.
    #[must_use]
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Returns the configured sources.
    #[must_use]
    pub fn sources(&self) -> &[Box<dyn ProxySource>] {
        &self.sources
    }

    /// Hands out an egress for one request attempt.
    ///
    /// Selection is weighted-random over the live set, favoring proxies with
    /// fewer recent failures while keeping every live proxy selectable.
    /// Quarantined proxies are re-probed at most once per re-probe interval,
    /// whether or not others are live. When the live set is empty the pool
    /// re-probes due quarantined proxies, then refills from its sources, then
    /// falls back to [`ProxyHandle::Direct`] if allowed.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Exhausted`] when nothing is live and direct
    /// connections are disabled.
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Result<ProxyHandle, ProxyError> {
        self.reprobe_if_due().await;
        if let Some(handle) = self.select().await {
            return Ok(handle);
        }

        if self.reprobe_quarantined().await > 0
            && let Some(handle) = self.select().await
        {
            return Ok(handle);
        }

        self.refill_if_due().await;
        if let Some(handle) = self.select().await {
            return Ok(handle);
        }

        if self.settings.allow_direct {
            debug!("proxy pool empty, using direct connection");
            Ok(ProxyHandle::Direct)
        } else {
            warn!("proxy pool exhausted");
            Err(ProxyError::Exhausted)
        }
    }

    /// Reports how a handed-out proxy performed.
    ///
    /// Direct handles and proxies already quarantined are ignored.
    #[instrument(skip(self), fields(proxy = %handle))]
    pub async fn release(&self, handle: &ProxyHandle, outcome: Outcome) {
        let ProxyHandle::Proxy { address, .. } = handle else {
            return;
        };

        let mut state = self.state.lock().await;
        let Some(pos) = state.live.iter().position(|r| &r.address == address) else {
            return;
        };

        match outcome {
            Outcome::Success => state.live[pos].consecutive_failures = 0,
            Outcome::Failure => {
                let failures = {
                    let record = &mut state.live[pos];
                    record.consecutive_failures += 1;
                    record.consecutive_failures
                };
                if failures >= self.settings.failure_threshold {
                    let mut record = state.live.swap_remove(pos);
                    record.quarantine();
                    warn!(
                        proxy = %record.address,
                        failures,
                        live = state.live.len(),
                        "proxy quarantined"
                    );
                    state.quarantined.push(record);
                } else {
                    debug!(proxy = %address, failures, "proxy failure recorded");
                }
            }
        }
    }

    /// Collects candidates from every source, probes the new ones, and admits
    /// those that pass. Returns how many were admitted.
    ///
    /// Candidates already live or quarantined are not probed again here;
    /// quarantined proxies only return through [`reprobe_quarantined`](Self::reprobe_quarantined).
    #[instrument(skip(self))]
    pub async fn refill(&self) -> usize {
        let _refill = self.refill_lock.lock().await;
        self.refill_locked().await
    }

    async fn refill_if_due(&self) {
        let _refill = self.refill_lock.lock().await;
        {
            let state = self.state.lock().await;
            if !state.live.is_empty() {
                return;
            }
            if let Some(last) = state.last_refill
                && last.elapsed() < self.settings.reprobe_interval
            {
                debug!("skipping refill, last one is recent");
                return;
            }
        }
        self.refill_locked().await;
    }

    async fn reprobe_if_due(&self) {
        {
            let mut state = self.state.lock().await;
            if state.quarantined.is_empty() {
                return;
            }
            if let Some(last) = state.last_reprobe
                && last.elapsed() < self.settings.reprobe_interval
            {
                return;
            }
            // Stamped before probing so concurrent callers skip this round.
            state.last_reprobe = Some(Instant::now());
        }
        self.reprobe_quarantined().await;
    }

    async fn refill_locked(&self) -> usize {
        let mut candidates = Vec::new();
        for source in &self.sources {
            match source.candidates().await {
                Ok(found) => {
                    debug!(source = source.name(), count = found.len(), "collected proxy candidates");
                    candidates.extend(found);
                }
                Err(e) => warn!(source = source.name(), error = %e, "proxy source failed"),
            }
        }

        let known: HashSet<String> = {
            let state = self.state.lock().await;
            state
                .live
                .iter()
                .chain(state.quarantined.iter())
                .map(|r| r.address.clone())
                .collect()
        };
        let mut seen = HashSet::new();
        candidates.retain(|r| !known.contains(&r.address) && seen.insert(r.address.clone()));
        let candidate_count = candidates.len();

        let admitted = self.probe_all(candidates).await;
        let admitted_count = admitted.len();
        let live = {
            let mut state = self.state.lock().await;
            for mut record in admitted {
                if !state.live.iter().any(|r| r.address == record.address) {
                    record.reset();
                    state.live.push(record);
                }
            }
            state.last_refill = Some(Instant::now());
            state.live.len()
        };

        info!(
            candidates = candidate_count,
            admitted = admitted_count,
            live,
            "proxy pool refilled"
        );

        if let Some(path) = &self.settings.persist_path
            && let Err(e) = self.save_live(path).await
        {
            warn!(error = %e, "failed to save live proxy set");
        }

        admitted_count
    }

    /// Probes quarantined proxies whose quarantine is older than the re-probe
    /// interval and restores the ones that pass. Returns how many returned.
    #[instrument(skip(self))]
    pub async fn reprobe_quarantined(&self) -> usize {
        let interval = self.settings.reprobe_interval;
        let due: Vec<ProxyRecord> = {
            let state = self.state.lock().await;
            state
                .quarantined
                .iter()
                .filter(|r| r.quarantined_at.is_none_or(|at| at.elapsed() >= interval))
                .cloned()
                .collect()
        };
        if due.is_empty() {
            return 0;
        }

        let due_addresses: HashSet<String> = due.iter().map(|r| r.address.clone()).collect();
        let passed = self.probe_all(due).await;
        let passed_addresses: HashSet<&str> = passed.iter().map(|r| r.address.as_str()).collect();

        let mut state = self.state.lock().await;
        let mut restored = 0;
        let mut still_cold = Vec::with_capacity(state.quarantined.len());
        for mut record in std::mem::take(&mut state.quarantined) {
            if passed_addresses.contains(record.address.as_str()) {
                record.reset();
                state.live.push(record);
                restored += 1;
            } else {
                if due_addresses.contains(&record.address) {
                    // Failed again; wait another full interval.
                    record.quarantine();
                }
                still_cold.push(record);
            }
        }
        state.quarantined = still_cold;

        info!(
            probed = due_addresses.len(),
            restored,
            quarantined = state.quarantined.len(),
            "re-probed quarantined proxies"
        );
        restored
    }

    /// Returns current counters.
    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        PoolStatus {
            live: state.live.len(),
            quarantined: state.quarantined.len(),
            allow_direct: self.settings.allow_direct,
        }
    }

    /// Snapshot of the live set.
    pub async fn live_records(&self) -> Vec<ProxyRecord> {
        self.state.lock().await.live.clone()
    }

    /// Snapshot of the quarantined set.
    pub async fn quarantined_records(&self) -> Vec<ProxyRecord> {
        self.state.lock().await.quarantined.clone()
    }

    /// Atomically writes the live set to `path` as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Persist`] if the file cannot be written.
    pub async fn save_live(&self, path: &Path) -> Result<(), ProxyError> {
        let live = self.live_records().await;
        write_json_atomic(path, &live).await?;
        debug!(path = %path.display(), count = live.len(), "saved live proxy set");
        Ok(())
    }

    async fn select(&self) -> Option<ProxyHandle> {
        let mut state = self.state.lock().await;
        let index = {
            let weights: Vec<f64> = state
                .live
                .iter()
                .map(|r| 1.0 / (1.0 + f64::from(r.consecutive_failures)))
                .collect();
            WeightedIndex::new(&weights)
                .ok()?
                .sample(&mut rand::thread_rng())
        };
        let record = &mut state.live[index];
        record.last_used_at = Some(Instant::now());
        Some(record.handle())
    }

    async fn probe_all(&self, candidates: Vec<ProxyRecord>) -> Vec<ProxyRecord> {
        let probe = &self.probe;
        stream::iter(candidates)
            .map(|record| async move {
                let healthy = probe.check(&record).await;
                (record, healthy)
            })
            .buffer_unordered(self.settings.probe_concurrency.max(1))
            .filter_map(|(record, healthy)| async move { healthy.then_some(record) })
            .collect()
            .await
    }
}
