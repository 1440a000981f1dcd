//! Proxy health probes.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::ProxyRecord;
use crate::fetch::build_client;

/// Decides whether a proxy is usable.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Returns `true` if the proxy passed the check.
    async fn check(&self, record: &ProxyRecord) -> bool;
}

/// Probe that requests a test URL through the proxy and expects a 200.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    test_url: String,
    timeout: Duration,
}

impl HttpProbe {
    /// Creates a probe against `test_url` with a per-check `timeout`.
    pub fn new(test_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            test_url: test_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self, record: &ProxyRecord) -> bool {
        let proxy_url = record.url();
        let client = match build_client(Some(&proxy_url), self.timeout) {
            Ok(client) => client,
            Err(e) => {
                debug!(proxy = %record.address, error = %e, "probe client build failed");
                return false;
            }
        };

        match client.get(&self.test_url).timeout(self.timeout).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => true,
            Ok(response) => {
                debug!(proxy = %record.address, status = %response.status(), "probe rejected");
                false
            }
            Err(e) => {
                debug!(proxy = %record.address, error = %e, "probe failed");
                false
            }
        }
    }
}
