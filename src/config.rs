//! Application configuration loaded from `config.json`.
//!
//! Every field has a default, so a missing file or a partial document yields a
//! usable configuration. Values are validated once at load time; an invalid
//! value is the only startup-fatal condition in the crate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Default public proxy list endpoint (geonode free list, newest first).
pub const DEFAULT_PROXY_API: &str = "https://proxylist.geonode.com/api/proxy-list?limit=500&page=1&sort_by=lastChecked&sort_type=desc&protocols=http%2Chttps";

/// Upper bound accepted for `max_workers_ceiling`.
const MAX_WORKER_CEILING: usize = 100;

/// Upper bound accepted for any timeout, in seconds.
const MAX_TIMEOUT_SECS: u64 = 3600;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path of the config file.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`AppConfig`].
    #[error("invalid config file {path}: {source}")]
    Parse {
        /// Path of the config file.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A value is outside its accepted range.
    #[error("invalid config value for `{field}`: {value}. Expected {expected}")]
    InvalidValue {
        /// Name of the offending key.
        field: &'static str,
        /// The rejected value, rendered.
        value: String,
        /// Description of the accepted range.
        expected: &'static str,
    },
}

impl ConfigError {
    /// Creates an out-of-range value error.
    pub fn invalid(field: &'static str, value: impl ToString, expected: &'static str) -> Self {
        Self::InvalidValue {
            field,
            value: value.to_string(),
            expected,
        }
    }
}

/// Top-level configuration.
///
/// Key names follow the historical `config.json` layout so existing files keep
/// working.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Target directory for downloaded assets.
    pub download_dir: PathBuf,
    /// How many not-yet-downloaded items one download run may fetch.
    pub download_limit: usize,
    /// Worker count for downloads in throughput mode.
    pub download_max_workers: usize,
    /// Worker count for catalog and listing crawls in throughput mode.
    pub crawler_max_workers: usize,
    /// Selects the cautious posture.
    pub safe_mode_enabled: bool,
    /// Days an entity stays fresh in the crawl cache.
    pub singer_crawl_cache_days: u32,
    /// Days a download index entry satisfies the skip rule.
    pub downloaded_cache_days: u32,
    /// Route requests through the proxy pool.
    pub proxy_enabled: bool,
    /// Site root used to build catalog, listing, and download URLs.
    pub base_url: String,
    /// Persisted entity store.
    pub entities_file: PathBuf,
    /// Persisted item store.
    pub items_file: PathBuf,
    /// Crawl cache document.
    pub crawl_cache_file: PathBuf,
    /// Download index document.
    pub download_index_file: PathBuf,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Wall-clock ceiling for one logical fetch, retries included, in seconds.
    pub fetch_ceiling_secs: u64,
    /// Upper clamp for any resolved worker count.
    pub max_workers_ceiling: usize,
    /// Proxy pool settings.
    pub proxy: ProxyConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("music_downloads"),
            download_limit: 20,
            download_max_workers: 3,
            crawler_max_workers: 3,
            safe_mode_enabled: false,
            singer_crawl_cache_days: 28,
            downloaded_cache_days: 180,
            proxy_enabled: true,
            base_url: "https://www.33ve.com".to_string(),
            entities_file: PathBuf::from("singers_33ve.json"),
            items_file: PathBuf::from("songs_33ve.json"),
            crawl_cache_file: PathBuf::from("crawl_cache.json"),
            download_index_file: PathBuf::from("downloaded_cache.json"),
            request_timeout_secs: 30,
            fetch_ceiling_secs: 300,
            max_workers_ceiling: 32,
            proxy: ProxyConfig::default(),
        }
    }
}

/// Proxy pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Line-oriented `address:port` seed file.
    pub manual_list: PathBuf,
    /// Where the live set is saved after a refill and reloaded on start.
    pub cache_file: PathBuf,
    /// JSON proxy-list endpoints to query on refill.
    pub api_sources: Vec<String>,
    /// Maximum candidates taken from each API source.
    pub api_max_candidates: usize,
    /// URL probed through each candidate; defaults to the site root.
    pub test_url: Option<String>,
    /// Probe request timeout in seconds.
    pub probe_timeout_secs: u64,
    /// Concurrent probes during a refill.
    pub probe_concurrency: usize,
    /// Consecutive failures that move a proxy to quarantine.
    pub failure_threshold: u32,
    /// Minimum quarantine age before a proxy is re-probed, in seconds.
    pub reprobe_interval_secs: u64,
    /// Fall back to a direct connection when no live proxy remains.
    pub allow_direct_fallback: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            manual_list: PathBuf::from("manual_proxies.txt"),
            cache_file: PathBuf::from("working_proxies.json"),
            api_sources: vec![DEFAULT_PROXY_API.to_string()],
            api_max_candidates: 50,
            test_url: None,
            probe_timeout_secs: 10,
            probe_concurrency: 20,
            failure_threshold: 3,
            reprobe_interval_secs: 300,
            allow_direct_fallback: true,
        }
    }
}

impl AppConfig {
    /// Loads configuration from `path`, falling back to defaults when the file
    /// does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, is not valid JSON,
    /// or contains out-of-range values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            info!(path = %path.display(), "loaded configuration");
            config
        } else {
            debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates values against runtime constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_WORKER_CEILING).contains(&self.max_workers_ceiling) {
            return Err(ConfigError::invalid(
                "max_workers_ceiling",
                self.max_workers_ceiling,
                "range 1..=100",
            ));
        }
        if self.download_max_workers == 0 {
            return Err(ConfigError::invalid(
                "download_max_workers",
                0,
                "at least 1",
            ));
        }
        if self.crawler_max_workers == 0 {
            return Err(ConfigError::invalid("crawler_max_workers", 0, "at least 1"));
        }
        validate_timeout_secs("request_timeout_secs", self.request_timeout_secs)?;
        validate_timeout_secs("fetch_ceiling_secs", self.fetch_ceiling_secs)?;
        validate_timeout_secs("proxy.probe_timeout_secs", self.proxy.probe_timeout_secs)?;
        if self.proxy.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "proxy.failure_threshold",
                0,
                "at least 1",
            ));
        }
        if self.proxy.probe_concurrency == 0 {
            return Err(ConfigError::invalid(
                "proxy.probe_concurrency",
                0,
                "at least 1",
            ));
        }
        if url::Url::parse(&self.base_url).is_err() {
            return Err(ConfigError::invalid(
                "base_url",
                &self.base_url,
                "an absolute http(s) URL",
            ));
        }
        Ok(())
    }

    /// Site root without a trailing slash.
    #[must_use]
    pub fn site_root(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// URL probed through proxy candidates.
    #[must_use]
    pub fn probe_url(&self) -> String {
        self.proxy
            .test_url
            .clone()
            .unwrap_or_else(|| format!("{}/", self.site_root()))
    }

    /// Per-request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Ceiling for one logical fetch including retries.
    #[must_use]
    pub fn fetch_ceiling(&self) -> Duration {
        Duration::from_secs(self.fetch_ceiling_secs)
    }
}

fn validate_timeout_secs(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if !(1..=MAX_TIMEOUT_SECS).contains(&value) {
        return Err(ConfigError::invalid(field, value, "range 1..=3600"));
    }
    Ok(())
}
