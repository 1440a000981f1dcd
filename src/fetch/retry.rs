//! Retry logic with exponential backoff.
//!
//! One [`RetryPolicy`] value drives every retry loop in the crate: the fetch
//! loop in [`Fetcher`](super::Fetcher) and the per-item loop in the download
//! manager. Failures are first classified into a [`FailureType`], then the
//! policy decides whether another attempt is worth it and how long to wait.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use harvester_core::fetch::{FetchError, RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(80), 2.0);
//! let error = FetchError::status("https://example.com/page.html", 503, None);
//!
//! match policy.should_retry(classify_error(&error), 1) {
//!     RetryDecision::Retry { attempt, .. } => assert_eq!(attempt, 2),
//!     RetryDecision::DoNotRetry { reason } => panic!("{reason}"),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::FetchError;

/// Default maximum attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

const DEFAULT_JITTER: Duration = Duration::from_millis(500);

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: timeout, connection reset, 5xx, empty body.
    Transient,

    /// The remote refused this client (HTTP 403). Retried through a
    /// different egress.
    Blocked,

    /// Server rate limiting (HTTP 429). Honors `Retry-After` when present.
    RateLimited,

    /// Failure that won't succeed regardless of retries.
    ///
    /// Examples: 404, malformed response, local disk error.
    Permanent,
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Retry behavior with exponential backoff.
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt - 1), max_delay) + jitter
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f32,
    jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with custom settings and the default jitter.
    ///
    /// `max_attempts` includes the initial attempt and is raised to at least 1.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            jitter: DEFAULT_JITTER,
        }
    }

    /// Replaces the attempt budget, keeping the backoff settings.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Replaces the jitter upper bound.
    #[must_use]
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Determines whether to retry after `attempt` (1-indexed) failed.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Backoff before the attempt following `attempt`, jitter included.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * f64::from(self.backoff_multiplier).powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + self.calculate_jitter()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter(&self) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// Classifies a fetch error for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | Timeout, Connection, ClientBuild, EmptyBody | Transient |
/// | HTTP 403 | Blocked |
/// | HTTP 429 | RateLimited |
/// | HTTP 408, 5xx | Transient |
/// | Other HTTP 4xx | Permanent |
/// | MalformedResponse, InvalidUrl, Io | Permanent |
/// | ProxyPoolExhausted | Permanent |
#[must_use]
pub fn classify_error(error: &FetchError) -> FailureType {
    match error {
        FetchError::Timeout { .. }
        | FetchError::Connection { .. }
        | FetchError::ClientBuild { .. }
        | FetchError::EmptyBody { .. } => FailureType::Transient,

        FetchError::Blocked { status: 429, .. } => FailureType::RateLimited,
        FetchError::Blocked { .. } => FailureType::Blocked,

        FetchError::HttpStatus { status, .. } => classify_http_status(*status),

        FetchError::MalformedResponse { .. }
        | FetchError::InvalidUrl { .. }
        | FetchError::Io { .. }
        | FetchError::ProxyPoolExhausted { .. } => FailureType::Permanent,

        FetchError::ExhaustedRetries { last, .. } => classify_error(last),
    }
}

fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 | 500..=599 => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(100),
            Duration::from_millis(400),
            2.0,
        )
        .with_jitter(Duration::ZERO)
    }

    // ==================== RetryPolicy Tests ====================

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(32));
        assert_eq!(policy.jitter, Duration::from_millis(500));
    }

    #[test]
    fn test_retry_policy_max_attempts_minimum_is_one() {
        assert_eq!(RetryPolicy::default().with_max_attempts(0).max_attempts(), 1);
        assert_eq!(quick_policy(0).max_attempts(), 1);
    }

    #[test]
    fn test_delay_grows_exponentially_and_caps() {
        let policy = quick_policy(10);
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(400));
        assert_eq!(policy.calculate_delay(6), Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = quick_policy(3).with_jitter(Duration::from_millis(50));
        for _ in 0..50 {
            let delay = policy.calculate_delay(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_should_retry_until_max_attempts() {
        let policy = quick_policy(3);
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 1),
            RetryDecision::Retry { attempt: 2, .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::Blocked, 2),
            RetryDecision::Retry { attempt: 3, .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 3),
            RetryDecision::DoNotRetry { .. }
        ));
    }

    #[test]
    fn test_should_not_retry_permanent() {
        let decision = quick_policy(5).should_retry(FailureType::Permanent, 1);
        let RetryDecision::DoNotRetry { reason } = decision else {
            panic!("permanent failures must not retry");
        };
        assert!(reason.contains("permanent"));
    }

    // ==================== classify_error Tests ====================

    #[test]
    fn test_classify_network_errors_transient() {
        assert_eq!(classify_error(&FetchError::timeout("u")), FailureType::Transient);
        assert_eq!(
            classify_error(&FetchError::EmptyBody { url: "u".to_string() }),
            FailureType::Transient
        );
        assert_eq!(
            classify_error(&FetchError::status("u", 502, None)),
            FailureType::Transient
        );
        assert_eq!(
            classify_error(&FetchError::status("u", 408, None)),
            FailureType::Transient
        );
    }

    #[test]
    fn test_classify_block_statuses() {
        assert_eq!(
            classify_error(&FetchError::status("u", 403, None)),
            FailureType::Blocked
        );
        assert_eq!(
            classify_error(&FetchError::status("u", 429, None)),
            FailureType::RateLimited
        );
    }

    #[test]
    fn test_classify_permanent() {
        assert_eq!(
            classify_error(&FetchError::status("u", 404, None)),
            FailureType::Permanent
        );
        assert_eq!(
            classify_error(&FetchError::malformed("u", "bad utf-8")),
            FailureType::Permanent
        );
        assert_eq!(
            classify_error(&FetchError::ProxyPoolExhausted { url: "u".to_string() }),
            FailureType::Permanent
        );
    }

    #[test]
    fn test_classify_sees_through_exhausted_retries() {
        let wrapped = FetchError::ExhaustedRetries {
            url: "u".to_string(),
            attempts: 3,
            last: Box::new(FetchError::timeout("u")),
        };
        assert_eq!(classify_error(&wrapped), FailureType::Transient);
    }
}
