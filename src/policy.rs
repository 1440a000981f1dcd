//! Operating posture resolution.
//!
//! Every component takes an [`EffectivePolicy`] value in its constructor. The
//! two postures differ only in the numbers they put into that value; there is
//! no cautious-mode code path anywhere else.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use harvester_core::policy::{Mode, Overrides, PolicyResolver};
//!
//! let resolver = PolicyResolver::new(32, Duration::from_secs(30), Duration::from_secs(300)).unwrap();
//! let overrides = Overrides { max_workers: Some(8), ..Overrides::default() };
//!
//! let fast = resolver.resolve(Mode::Throughput, &overrides).unwrap();
//! assert_eq!(fast.max_workers, 8);
//!
//! // Cautious mode always serializes work.
//! let safe = resolver.resolve(Mode::Cautious, &overrides).unwrap();
//! assert_eq!(safe.max_workers, 1);
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config::{AppConfig, ConfigError};
use crate::fetch::RetryPolicy;

/// Smallest worker count any policy resolves to.
pub const MIN_WORKERS: usize = 1;

/// Worker count used when neither config nor caller specify one.
pub const DEFAULT_WORKERS: usize = 3;

/// Operating posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Parallel workers, short randomized delays.
    #[default]
    Throughput,
    /// One worker, long randomized delays, more patient retries.
    Cautious,
}

impl Mode {
    /// Maps the `safe_mode_enabled` flag onto a posture.
    #[must_use]
    pub fn from_safe_mode(enabled: bool) -> Self {
        if enabled { Self::Cautious } else { Self::Throughput }
    }
}

/// How requests leave the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyUsage {
    /// Pick a proxy from the pool for every attempt.
    Rotate,
    /// Connect directly; the pool is never consulted.
    Direct,
}

/// Inclusive range a randomized inter-request delay is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    /// Lower bound.
    pub min: Duration,
    /// Upper bound.
    pub max: Duration,
}

impl DelayRange {
    /// A range that never delays.
    pub const ZERO: Self = Self {
        min: Duration::ZERO,
        max: Duration::ZERO,
    };

    /// Creates a range from millisecond bounds.
    #[must_use]
    pub const fn from_millis(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_millis(min),
            max: Duration::from_millis(max),
        }
    }

    /// Whether the range always yields zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.max.is_zero()
    }

    /// Draws a delay uniformly from the range.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
    }
}

/// Retry parameters shared by the fetch layer and the download manager.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryLimits {
    /// Attempts per logical operation, the first one included.
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub base_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Upper bound of random jitter added to each backoff.
    pub jitter: Duration,
    /// Hard timeout of a single request.
    pub request_timeout: Duration,
    /// Wall-clock ceiling for one logical fetch, retries included.
    pub fetch_ceiling: Duration,
}

impl RetryLimits {
    /// Builds the reusable retry policy these limits describe.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.base_delay, self.max_delay, 2.0)
            .with_jitter(self.jitter)
    }
}

/// Fully resolved parameters for one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePolicy {
    /// Posture this policy was resolved from.
    pub mode: Mode,
    /// Bounded worker pool size.
    pub max_workers: usize,
    /// Delay drawn between consecutive requests to the same host.
    pub request_delay_range: DelayRange,
    /// Retry and timeout limits.
    pub retry_limits: RetryLimits,
    /// Egress selection.
    pub proxy_usage: ProxyUsage,
}

/// Caller-supplied values that take precedence over posture defaults.
///
/// Worker counts are still clamped, and cautious mode always wins on
/// concurrency.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Requested worker count.
    pub max_workers: Option<usize>,
    /// Requested attempt limit.
    pub max_attempts: Option<u32>,
    /// Requested inter-request delay range.
    pub request_delay: Option<DelayRange>,
    /// Requested base backoff.
    pub retry_base_delay: Option<Duration>,
    /// Requested backoff cap.
    pub retry_max_delay: Option<Duration>,
    /// Requested backoff jitter bound.
    pub retry_jitter: Option<Duration>,
    /// Requested egress selection.
    pub proxy_usage: Option<ProxyUsage>,
}

/// Posture defaults before overrides.
struct Posture {
    workers: Option<usize>,
    delay: DelayRange,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
}

const THROUGHPUT: Posture = Posture {
    workers: None,
    delay: DelayRange::from_millis(100, 500),
    max_attempts: 3,
    base_delay: Duration::from_secs(1),
    max_delay: Duration::from_secs(16),
    jitter: Duration::from_millis(500),
};

const CAUTIOUS: Posture = Posture {
    workers: Some(1),
    delay: DelayRange::from_millis(2000, 4000),
    max_attempts: 5,
    base_delay: Duration::from_secs(2),
    max_delay: Duration::from_secs(32),
    jitter: Duration::from_secs(2),
};

/// Resolves a [`Mode`] plus [`Overrides`] into an [`EffectivePolicy`].
#[derive(Debug, Clone)]
pub struct PolicyResolver {
    worker_ceiling: usize,
    request_timeout: Duration,
    fetch_ceiling: Duration,
}

impl PolicyResolver {
    /// Creates a resolver.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the ceiling is zero or a timeout is zero.
    pub fn new(
        worker_ceiling: usize,
        request_timeout: Duration,
        fetch_ceiling: Duration,
    ) -> Result<Self, ConfigError> {
        if worker_ceiling < MIN_WORKERS {
            return Err(ConfigError::invalid(
                "max_workers_ceiling",
                worker_ceiling,
                "at least 1",
            ));
        }
        if request_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "request_timeout_secs",
                0,
                "at least 1",
            ));
        }
        if fetch_ceiling.is_zero() {
            return Err(ConfigError::invalid("fetch_ceiling_secs", 0, "at least 1"));
        }
        Ok(Self {
            worker_ceiling,
            request_timeout,
            fetch_ceiling,
        })
    }

    /// Creates a resolver from application config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for invalid ceiling or timeout values.
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        Self::new(
            config.max_workers_ceiling,
            config.request_timeout(),
            config.fetch_ceiling(),
        )
    }

    /// Returns the configured worker ceiling.
    #[must_use]
    pub fn worker_ceiling(&self) -> usize {
        self.worker_ceiling
    }

    /// Resolves the effective policy for one operation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an override delay range is inverted.
    pub fn resolve(&self, mode: Mode, overrides: &Overrides) -> Result<EffectivePolicy, ConfigError> {
        let posture = match mode {
            Mode::Throughput => &THROUGHPUT,
            Mode::Cautious => &CAUTIOUS,
        };

        let request_delay_range = overrides.request_delay.unwrap_or(posture.delay);
        if request_delay_range.min > request_delay_range.max {
            return Err(ConfigError::invalid(
                "request_delay",
                format!("{request_delay_range:?}"),
                "min <= max",
            ));
        }

        let requested = overrides.max_workers.unwrap_or(DEFAULT_WORKERS);
        let max_workers = posture
            .workers
            .unwrap_or(requested)
            .clamp(MIN_WORKERS, self.worker_ceiling);

        let retry_limits = RetryLimits {
            max_attempts: overrides.max_attempts.unwrap_or(posture.max_attempts).max(1),
            base_delay: overrides.retry_base_delay.unwrap_or(posture.base_delay),
            max_delay: overrides.retry_max_delay.unwrap_or(posture.max_delay),
            jitter: overrides.retry_jitter.unwrap_or(posture.jitter),
            request_timeout: self.request_timeout,
            fetch_ceiling: self.fetch_ceiling,
        };

        let policy = EffectivePolicy {
            mode,
            max_workers,
            request_delay_range,
            retry_limits,
            proxy_usage: overrides.proxy_usage.unwrap_or(ProxyUsage::Rotate),
        };

        debug!(
            ?mode,
            max_workers,
            requested_workers = ?overrides.max_workers,
            delay_min_ms = request_delay_range.min.as_millis(),
            delay_max_ms = request_delay_range.max.as_millis(),
            max_attempts = retry_limits.max_attempts,
            proxy_usage = ?policy.proxy_usage,
            "resolved policy"
        );

        Ok(policy)
    }
}
