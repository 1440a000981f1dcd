//! The fetcher: the only component that touches the network.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use reqwest::header::{REFERER, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::client::build_client;
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
use super::throttle::{Throttle, parse_retry_after};
use super::FetchError;
use crate::policy::{EffectivePolicy, ProxyUsage};
use crate::proxy::{Outcome, ProxyHandle, ProxyPool};
use crate::user_agent::random_user_agent;

/// Per-call adjustments to a fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// `Referer` header to send.
    pub referer: Option<String>,
    /// Overrides the policy's attempt limit for this call.
    pub max_attempts: Option<u32>,
}

/// A successful response.
#[derive(Debug, Clone)]
pub struct Payload {
    /// The requested URL.
    pub url: String,
    /// HTTP status of the final response.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
    /// Egress that carried the successful attempt.
    pub proxy: ProxyHandle,
}

impl Payload {
    /// Decodes the body as UTF-8.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::MalformedResponse`] if the body is not valid UTF-8.
    pub fn text(&self) -> Result<&str, FetchError> {
        std::str::from_utf8(&self.body)
            .map_err(|e| FetchError::malformed(&self.url, format!("invalid UTF-8: {e}")))
    }
}

/// Retrieves URLs through the proxy pool with retry, backoff, identity
/// rotation, and per-host throttling.
///
/// Each attempt acquires its own egress, so a retry may go out through a
/// different proxy. Proxy-attributable failures (timeouts, connection errors,
/// 403/429) are reported to the pool against the proxy that carried them.
#[derive(Debug)]
pub struct Fetcher {
    pool: Arc<ProxyPool>,
    proxy_usage: ProxyUsage,
    retry: RetryPolicy,
    request_timeout: Duration,
    fetch_ceiling: Duration,
    throttle: Throttle,
    clients: DashMap<ProxyHandle, Client>,
}

impl Fetcher {
    /// Creates a fetcher drawing egresses from `pool` under `policy`.
    #[must_use]
    pub fn new(pool: Arc<ProxyPool>, policy: &EffectivePolicy) -> Self {
        Self {
            pool,
            proxy_usage: policy.proxy_usage,
            retry: policy.retry_limits.retry_policy(),
            request_timeout: policy.retry_limits.request_timeout,
            fetch_ceiling: policy.retry_limits.fetch_ceiling,
            throttle: Throttle::new(policy.request_delay_range),
            clients: DashMap::new(),
        }
    }

    /// Returns the proxy pool this fetcher reports to.
    #[must_use]
    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    /// Returns the retry policy applied to each fetch.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Fetches `url` with default options.
    ///
    /// # Errors
    ///
    /// See [`fetch_with`](Self::fetch_with).
    pub async fn fetch(&self, url: &str) -> Result<Payload, FetchError> {
        self.fetch_with(url, &FetchOptions::default()).await
    }

    /// Fetches `url` and returns the full body.
    ///
    /// # Errors
    ///
    /// - [`FetchError::ExhaustedRetries`] when every attempt failed retryably
    /// - the attempt's own error when it was not retryable (404, bad URL)
    /// - [`FetchError::ProxyPoolExhausted`] when no egress is available
    #[instrument(skip(self, options), fields(url = %url))]
    pub async fn fetch_with(&self, url: &str, options: &FetchOptions) -> Result<Payload, FetchError> {
        let referer = options.referer.as_deref();
        let idle = self.request_timeout;
        let ((status, body), proxy) = self
            .run(url, options.max_attempts, |client, user_agent| async move {
                let response = send(&client, url, user_agent, referer, idle).await?;
                let status = response.status().as_u16();
                let body = tokio::time::timeout(idle, response.bytes())
                    .await
                    .map_err(|_| FetchError::timeout(url))?
                    .map_err(|e| FetchError::connection(url, e))?;
                Ok((status, body.to_vec()))
            })
            .await?;

        Ok(Payload {
            url: url.to_string(),
            status,
            body,
            proxy,
        })
    }

    /// Fetches an HTML page and decodes it as UTF-8.
    ///
    /// # Errors
    ///
    /// As [`fetch_with`](Self::fetch_with), plus
    /// [`FetchError::MalformedResponse`] for a body that is not UTF-8.
    pub async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        let payload = self.fetch(url).await?;
        payload.text().map(str::to_string)
    }

    /// Streams `url` into `dest`, returning the number of bytes written.
    ///
    /// The request timeout bounds the wait for response headers and the gap
    /// between body chunks, not the whole transfer; a slow but steady body is
    /// limited only by the fetch ceiling.
    ///
    /// `dest` is truncated at the start of every attempt and removed when an
    /// attempt fails, so a failed call leaves nothing behind.
    ///
    /// # Errors
    ///
    /// As [`fetch_with`](Self::fetch_with), plus [`FetchError::EmptyBody`]
    /// when zero bytes arrived and [`FetchError::Io`] for local write errors.
    pub async fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        self.fetch_to_file_with(url, dest, &FetchOptions::default())
            .await
    }

    /// Streams `url` into `dest` with per-call options.
    ///
    /// # Errors
    ///
    /// See [`fetch_to_file`](Self::fetch_to_file).
    #[instrument(skip(self, options), fields(url = %url, dest = %dest.display()))]
    pub async fn fetch_to_file_with(
        &self,
        url: &str,
        dest: &Path,
        options: &FetchOptions,
    ) -> Result<u64, FetchError> {
        let referer = options.referer.as_deref();
        let idle = self.request_timeout;
        let result = self
            .run(url, options.max_attempts, |client, user_agent| async move {
                let response = send(&client, url, user_agent, referer, idle).await?;
                let result = stream_to_file(response, url, dest, idle).await;
                if result.is_err() {
                    let _ = tokio::fs::remove_file(dest).await;
                }
                result
            })
            .await;
        match result {
            Ok((bytes, _)) => Ok(bytes),
            Err(e) => {
                // An attempt cut off by the fetch ceiling never reached its own cleanup.
                let _ = tokio::fs::remove_file(dest).await;
                Err(e)
            }
        }
    }

    /// Runs `attempt` under the retry policy, acquiring a fresh egress,
    /// client, and identity for each try.
    async fn run<T, F, Fut>(
        &self,
        url: &str,
        max_attempts: Option<u32>,
        mut attempt_fn: F,
    ) -> Result<(T, ProxyHandle), FetchError>
    where
        F: FnMut(Client, &'static str) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        url::Url::parse(url).map_err(|_| FetchError::InvalidUrl {
            url: url.to_string(),
        })?;

        let retry = match max_attempts {
            Some(n) => self.retry.clone().with_max_attempts(n),
            None => self.retry.clone(),
        };
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            let handle = self.egress(url).await?;
            let remaining = self.fetch_ceiling.saturating_sub(started.elapsed());

            let result = match self.client_for(&handle) {
                Ok(client) => {
                    self.throttle.acquire(url).await;
                    tokio::time::timeout(remaining, attempt_fn(client, random_user_agent()))
                        .await
                        .unwrap_or_else(|_| Err(FetchError::timeout(url)))
                }
                Err(e) => Err(e),
            };

            let error = match result {
                Ok(value) => {
                    self.pool.release(&handle, Outcome::Success).await;
                    debug!(attempt, proxy = %handle, "fetch succeeded");
                    return Ok((value, handle));
                }
                Err(e) => e,
            };

            let outcome = if error.is_proxy_attributable() {
                Outcome::Failure
            } else {
                Outcome::Success
            };
            self.pool.release(&handle, outcome).await;

            let retry_after = error.retry_after();
            if let Some(pause) = retry_after {
                self.throttle.record_pause(url, pause).await;
            }

            let failure_type = classify_error(&error);
            match retry.should_retry(failure_type, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    let delay = retry_after.unwrap_or(delay);
                    if started.elapsed() + delay >= self.fetch_ceiling {
                        warn!(attempt, "fetch ceiling reached");
                        return Err(exhausted(url, attempt, error));
                    }
                    debug!(
                        attempt,
                        proxy = %handle,
                        error = %error,
                        delay_ms = delay.as_millis(),
                        "retrying fetch"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(attempt, reason = %reason, error = %error, "fetch failed");
                    if failure_type == FailureType::Permanent {
                        return Err(error);
                    }
                    return Err(exhausted(url, attempt, error));
                }
            }
        }
    }

    async fn egress(&self, url: &str) -> Result<ProxyHandle, FetchError> {
        match self.proxy_usage {
            ProxyUsage::Direct => Ok(ProxyHandle::Direct),
            ProxyUsage::Rotate => self
                .pool
                .acquire()
                .await
                .map_err(|_| FetchError::ProxyPoolExhausted {
                    url: url.to_string(),
                }),
        }
    }

    fn client_for(&self, handle: &ProxyHandle) -> Result<Client, FetchError> {
        if let Some(client) = self.clients.get(handle) {
            return Ok(client.clone());
        }
        let client = build_client(handle.proxy_url().as_deref(), self.request_timeout).map_err(
            |source| FetchError::ClientBuild {
                egress: handle.to_string(),
                source,
            },
        )?;
        self.clients.insert(handle.clone(), client.clone());
        Ok(client)
    }
}

fn exhausted(url: &str, attempts: u32, last: FetchError) -> FetchError {
    FetchError::ExhaustedRetries {
        url: url.to_string(),
        attempts,
        last: Box::new(last),
    }
}

async fn send(
    client: &Client,
    url: &str,
    user_agent: &str,
    referer: Option<&str>,
    timeout: Duration,
) -> Result<Response, FetchError> {
    let mut request = client.get(url).header(USER_AGENT, user_agent);
    if let Some(referer) = referer {
        request = request.header(REFERER, referer);
    }
    let response = tokio::time::timeout(timeout, request.send())
        .await
        .map_err(|_| FetchError::timeout(url))?
        .map_err(|e| FetchError::connection(url, e))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
        response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after)
    } else {
        None
    };
    Err(FetchError::status(url, status.as_u16(), retry_after))
}

/// Writes the body to `dest`. `idle` bounds the wait for each chunk.
async fn stream_to_file(
    response: Response,
    url: &str,
    dest: &Path,
    idle: Duration,
) -> Result<u64, FetchError> {
    let file = File::create(dest)
        .await
        .map_err(|e| FetchError::io(dest, e))?;
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk) = tokio::time::timeout(idle, stream.next())
        .await
        .map_err(|_| FetchError::timeout(url))?
    {
        let chunk = chunk.map_err(|e| FetchError::connection(url, e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| FetchError::io(dest, e))?;
        bytes_written += chunk.len() as u64;
    }

    writer.flush().await.map_err(|e| FetchError::io(dest, e))?;

    if bytes_written == 0 {
        return Err(FetchError::EmptyBody {
            url: url.to_string(),
        });
    }
    Ok(bytes_written)
}
