//! Error taxonomy shared across the crawl and download operations.
//!
//! Each subsystem has its own `thiserror` enum; every one of them maps onto an
//! [`ErrorClass`], which is what batch reports carry. Only [`HarvestError`]
//! escapes an operation: configuration problems, total proxy pool exhaustion,
//! and store failures that leave nothing to report against.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StoreError;

/// Coarse classification of a failure, used for retry and reporting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Connection, timeout, or server-side failure. Retryable and may be
    /// attributed to the proxy that carried the request.
    Network,
    /// The remote refused service to this client (403/429). Retryable and
    /// counts against the proxy used.
    Blocked,
    /// Extraction or decoding failed. Not retried for that unit.
    Parse,
    /// Local filesystem failure.
    Disk,
    /// Invalid configuration.
    Config,
}

impl ErrorClass {
    /// Returns the class as a lowercase string slice.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Blocked => "blocked",
            Self::Parse => "parse",
            Self::Disk => "disk",
            Self::Config => "config",
        }
    }

    /// Whether failures of this class are worth another attempt.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Blocked)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A terminal failure of one unit of work (a page, an entity, an item).
///
/// Batch reports collect these instead of aborting the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    /// Identifier of the failed unit (page number, entity id, item id).
    pub unit: String,
    /// Taxonomy class of the failure.
    pub class: ErrorClass,
    /// Rendered error message.
    pub reason: String,
}

impl Failure {
    /// Creates a failure record.
    pub fn new(unit: impl Into<String>, class: ErrorClass, reason: impl fmt::Display) -> Self {
        Self {
            unit: unit.into(),
            class,
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.unit, self.class, self.reason)
    }
}

/// Operation-level errors returned by the [`Harvester`](crate::Harvester) entry points.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Configuration or policy resolution failed.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No live proxies remain and direct connections are not allowed.
    #[error("proxy pool exhausted during {operation}: no live proxies and direct fallback disabled")]
    ProxyPoolExhausted {
        /// Operation that was running when the pool ran dry.
        operation: &'static str,
    },

    /// A persisted document could not be read or written.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl HarvestError {
    /// Creates a pool exhaustion error for the named operation.
    #[must_use]
    pub fn pool_exhausted(operation: &'static str) -> Self {
        Self::ProxyPoolExhausted { operation }
    }

    /// Returns the taxonomy class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config(_) => ErrorClass::Config,
            Self::ProxyPoolExhausted { .. } => ErrorClass::Network,
            Self::Store(_) => ErrorClass::Disk,
        }
    }
}
