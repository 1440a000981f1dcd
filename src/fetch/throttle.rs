//! Per-host inter-request throttling.
//!
//! Consecutive requests to the same host are spaced by a random delay drawn
//! from the policy's [`DelayRange`]. Requests to different hosts do not wait
//! for each other. A server-mandated pause (`Retry-After`) pushes the host's
//! next allowed request time forward for every worker.
//!
//! # Example
//!
//! ```
//! use harvester_core::fetch::Throttle;
//! use harvester_core::policy::DelayRange;
//!
//! # async fn example() {
//! let throttle = Throttle::new(DelayRange::from_millis(100, 500));
//!
//! // First request to a host proceeds immediately.
//! throttle.acquire("https://example.com/a.html").await;
//!
//! // The next one to the same host waits 100-500ms.
//! throttle.acquire("https://example.com/b.html").await;
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::policy::DelayRange;

/// Warning threshold for cumulative delay per host.
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(60);

/// Maximum honored Retry-After value.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Per-host request spacing shared by all workers of a fetcher.
#[derive(Debug)]
pub struct Throttle {
    range: DelayRange,
    // Arc lets callers drop the shard lock before awaiting the inner mutex.
    hosts: DashMap<String, Arc<HostState>>,
}

#[derive(Debug)]
struct HostState {
    /// Earliest instant the next request may start. `None` until first use.
    next_allowed: Mutex<Option<Instant>>,
    cumulative_delay_ms: AtomicU64,
}

impl HostState {
    fn new() -> Self {
        Self {
            next_allowed: Mutex::new(None),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(total)
    }
}

impl Throttle {
    /// Creates a throttle drawing gaps from `range`.
    #[must_use]
    pub fn new(range: DelayRange) -> Self {
        Self {
            range,
            hosts: DashMap::new(),
        }
    }

    /// Returns the configured delay range.
    #[must_use]
    pub fn range(&self) -> DelayRange {
        self.range
    }

    /// Waits until a request to `url`'s host may start, then books the next slot.
    ///
    /// The first request to a host proceeds immediately unless a pause was
    /// recorded for it.
    #[instrument(skip(self), fields(host))]
    pub async fn acquire(&self, url: &str) {
        let host = extract_host(url);
        tracing::Span::current().record("host", host.as_str());

        let state = self.state_for(&host);
        let mut next_allowed = state.next_allowed.lock().await;

        if let Some(at) = *next_allowed {
            let now = Instant::now();
            if at > now {
                let delay = at - now;
                let cumulative = state.add_cumulative_delay(delay);
                debug!(
                    host = %host,
                    delay_ms = delay.as_millis(),
                    cumulative_ms = cumulative.as_millis(),
                    "throttling request"
                );
                if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                    warn!(
                        host = %host,
                        cumulative_delay_secs = cumulative.as_secs(),
                        "heavy throttling on host"
                    );
                }
                tokio::time::sleep(delay).await;
            }
        }

        *next_allowed = Some(Instant::now() + self.range.sample());
    }

    /// Records a server-mandated pause for `url`'s host.
    ///
    /// No request to the host starts before the pause ends.
    #[instrument(skip(self), fields(host))]
    pub async fn record_pause(&self, url: &str, delay: Duration) {
        let host = extract_host(url);
        tracing::Span::current().record("host", host.as_str());

        let state = self.state_for(&host);
        let until = Instant::now() + delay.min(MAX_RETRY_AFTER);
        let mut next_allowed = state.next_allowed.lock().await;
        if next_allowed.is_none_or(|at| at < until) {
            *next_allowed = Some(until);
        }
        debug!(host = %host, delay_ms = delay.as_millis(), "recorded server pause");
    }

    fn state_for(&self, host: &str) -> Arc<HostState> {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostState::new()))
            .clone()
    }
}

/// Extracts the lowercase host of `url`, or `"unknown"` when it has none.
///
/// ```
/// use harvester_core::fetch::extract_host;
///
/// assert_eq!(extract_host("https://Example.COM/a"), "example.com");
/// assert_eq!(extract_host("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a `Retry-After` header value.
///
/// Accepts integer seconds or an HTTP-date. Values above one hour are capped;
/// dates in the past yield zero.
///
/// ```
/// use std::time::Duration;
/// use harvester_core::fetch::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("999999"), Some(Duration::from_secs(3600)));
/// assert_eq!(parse_retry_after("soon"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<u64>() {
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }

    match httpdate::parse_http_date(header_value) {
        Ok(at) => Some(
            at.duration_since(std::time::SystemTime::now())
                .unwrap_or(Duration::ZERO)
                .min(MAX_RETRY_AFTER),
        ),
        Err(_) => {
            debug!(header_value, "unparseable Retry-After value");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== Throttle Tests ====================

    #[tokio::test]
    async fn test_zero_range_never_waits() {
        tokio::time::pause();
        let throttle = Throttle::new(DelayRange::ZERO);
        let start = Instant::now();

        for i in 0..5 {
            throttle.acquire(&format!("https://example.com/{i}")).await;
        }
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_same_host_is_spaced_within_range() {
        tokio::time::pause();
        let throttle = Throttle::new(DelayRange::from_millis(200, 400));
        let start = Instant::now();

        throttle.acquire("https://example.com/1").await;
        assert!(start.elapsed() < Duration::from_millis(10));

        throttle.acquire("https://example.com/2").await;
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(start.elapsed() <= Duration::from_millis(410));
    }

    #[tokio::test]
    async fn test_different_hosts_independent() {
        tokio::time::pause();
        let throttle = Throttle::new(DelayRange::from_millis(1000, 1000));

        throttle.acquire("https://a.com/1").await;
        let start = Instant::now();
        throttle.acquire("https://b.com/1").await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_recorded_pause_delays_next_request() {
        tokio::time::pause();
        let throttle = Throttle::new(DelayRange::ZERO);
        let start = Instant::now();

        throttle
            .record_pause("https://example.com/x", Duration::from_secs(5))
            .await;
        throttle.acquire("https://example.com/y").await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    // ==================== Parsing Tests ====================

    #[test]
    fn test_extract_host_variants() {
        assert_eq!(extract_host("https://example.com:8080/p"), "example.com");
        assert_eq!(extract_host("http://192.168.1.1/f"), "192.168.1.1");
        assert_eq!(extract_host(""), "unknown");
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after(" 30 "), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_negative_is_none() {
        assert_eq!(parse_retry_after("-5"), None);
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let future = std::time::SystemTime::now() + Duration::from_secs(120);
        let header = httpdate::fmt_http_date(future);
        let parsed = parse_retry_after(&header).unwrap();
        assert!(parsed <= Duration::from_secs(120));
        assert!(parsed >= Duration::from_secs(100));
    }

    #[test]
    fn test_parse_retry_after_past_date_is_zero() {
        let past = std::time::SystemTime::now() - Duration::from_secs(600);
        let header = httpdate::fmt_http_date(past);
        assert_eq!(parse_retry_after(&header), Some(Duration::ZERO));
    }
}
