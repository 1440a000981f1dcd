//! Proxy candidate sources.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{Protocol, ProxyError, ProxyRecord};
use crate::store::read_json;

/// Yields proxy candidates. Candidates are unverified until probed.
#[async_trait]
pub trait ProxySource: Send + Sync {
    /// Short name used in logs and status output.
    fn name(&self) -> &str;

    /// Collects the current candidate list.
    async fn candidates(&self) -> Result<Vec<ProxyRecord>, ProxyError>;
}

/// Parses one proxy list line.
///
/// Accepts `host:port` (assumed HTTP) or `scheme://host:port`. Blank lines and
/// `#` comments yield `None`, as do lines with an unknown scheme or no port.
#[must_use]
pub fn parse_proxy_line(line: &str) -> Option<ProxyRecord> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (protocol, address) = match line.split_once("://") {
        Some((scheme, rest)) => (scheme.parse::<Protocol>().ok()?, rest),
        None => (Protocol::Http, line),
    };
    let address = address.trim_end_matches('/');
    let (host, port) = address.rsplit_once(':')?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return None;
    }
    Some(ProxyRecord::new(address, protocol))
}

/// Plain-text list of proxies, one per line.
#[derive(Debug, Clone)]
pub struct ManualListSource {
    path: PathBuf,
}

impl ManualListSource {
    /// Creates a source reading `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ProxySource for ManualListSource {
    fn name(&self) -> &str {
        "manual"
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn candidates(&self) -> Result<Vec<ProxyRecord>, ProxyError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("manual proxy list not found");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(ProxyError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        Ok(contents.lines().filter_map(parse_proxy_line).collect())
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    data: Vec<ApiEntry>,
}

#[derive(Debug, Deserialize)]
struct ApiEntry {
    ip: String,
    port: serde_json::Value,
    #[serde(default)]
    protocols: Vec<String>,
}

impl ApiEntry {
    fn into_record(self) -> Option<ProxyRecord> {
        let port = match &self.port {
            serde_json::Value::String(s) => s.trim().parse::<u16>().ok()?,
            serde_json::Value::Number(n) => u16::try_from(n.as_u64()?).ok()?,
            _ => return None,
        };
        let protocol = self
            .protocols
            .iter()
            .find_map(|p| p.parse::<Protocol>().ok())?;
        Some(ProxyRecord::new(format!("{}:{port}", self.ip), protocol))
    }
}

/// Public proxy list API returning `{"data": [{"ip", "port", "protocols"}]}`.
#[derive(Debug, Clone)]
pub struct JsonApiSource {
    url: String,
    client: reqwest::Client,
    max_candidates: usize,
}

impl JsonApiSource {
    /// Creates a source for `url`, keeping at most `max_candidates` entries.
    #[must_use]
    pub fn new(url: impl Into<String>, max_candidates: usize, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            client,
            max_candidates,
        }
    }
}

#[async_trait]
impl ProxySource for JsonApiSource {
    fn name(&self) -> &str {
        &self.url
    }

    #[instrument(skip(self), fields(url = %self.url))]
    async fn candidates(&self) -> Result<Vec<ProxyRecord>, ProxyError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ProxyError::source_failed(&self.url, e))?;
        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| ProxyError::source_failed(&self.url, e))?;

        Ok(body
            .data
            .into_iter()
            .filter_map(ApiEntry::into_record)
            .take(self.max_candidates)
            .collect())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CachedEntry {
    Record(ProxyRecord),
    Legacy {
        ip: String,
        port: u16,
        #[serde(default = "default_protocol")]
        protocol: String,
    },
}

fn default_protocol() -> String {
    "http".to_string()
}

/// Live set saved by a previous run.
#[derive(Debug, Clone)]
pub struct CachedSource {
    path: PathBuf,
}

impl CachedSource {
    /// Creates a source reading the saved set at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ProxySource for CachedSource {
    fn name(&self) -> &str {
        "cache"
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn candidates(&self) -> Result<Vec<ProxyRecord>, ProxyError> {
        let entries = read_json::<Vec<CachedEntry>>(&self.path)
            .await
            .map_err(|e| ProxyError::source_failed("cache", e))?
            .unwrap_or_default();

        Ok(entries
            .into_iter()
            .filter_map(|entry| match entry {
                CachedEntry::Record(mut record) => {
                    record.consecutive_failures = 0;
                    record.is_quarantined = false;
                    Some(record)
                }
                CachedEntry::Legacy { ip, port, protocol } => protocol
                    .parse::<Protocol>()
                    .ok()
                    .map(|p| ProxyRecord::new(format!("{ip}:{port}"), p)),
            })
            .collect())
    }
}
