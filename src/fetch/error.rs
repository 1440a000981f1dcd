//! Error types for the fetch layer.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::error::ErrorClass;

/// Errors that can occur while retrieving a URL.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The request did not finish within its timeout.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Connection-level failure (refused, reset, DNS, proxy handshake).
    #[error("connection error fetching {url}: {source}")]
    Connection {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// The remote refused service to this client (HTTP 403 or 429).
    #[error("blocked fetching {url} (HTTP {status})")]
    Blocked {
        /// The URL that was refused.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// Server-mandated wait, from a `Retry-After` header.
        retry_after: Option<Duration>,
    },

    /// Any other unsuccessful HTTP status.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The response arrived but could not be decoded.
    #[error("malformed response from {url}: {reason}")]
    MalformedResponse {
        /// The URL that returned the response.
        url: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A file transfer completed with zero bytes.
    #[error("empty body from {url}")]
    EmptyBody {
        /// The URL that returned nothing.
        url: String,
    },

    /// The URL could not be parsed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// Writing the fetched body to disk failed.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// An HTTP client for the chosen egress could not be built.
    #[error("failed to build HTTP client for {egress}: {source}")]
    ClientBuild {
        /// The egress the client was for.
        egress: String,
        /// The underlying builder error.
        #[source]
        source: reqwest::Error,
    },

    /// No live proxy was available and direct connections are disabled.
    #[error("proxy pool exhausted while fetching {url}")]
    ProxyPoolExhausted {
        /// The URL being fetched.
        url: String,
    },

    /// Every attempt failed with a retryable error.
    #[error("giving up on {url} after {attempts} attempts: {last}")]
    ExhaustedRetries {
        /// The URL being fetched.
        url: String,
        /// How many attempts were made.
        attempts: u32,
        /// The error of the final attempt.
        #[source]
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a connection error, promoting reqwest timeouts to [`Self::Timeout`].
    pub fn connection(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::timeout(url)
        } else {
            Self::Connection {
                url: url.into(),
                source,
            }
        }
    }

    /// Creates the error for an unsuccessful HTTP status.
    pub fn status(url: impl Into<String>, status: u16, retry_after: Option<Duration>) -> Self {
        let url = url.into();
        if matches!(status, 403 | 429) {
            Self::Blocked {
                url,
                status,
                retry_after,
            }
        } else {
            Self::HttpStatus { url, status }
        }
    }

    /// Creates a malformed response error.
    pub fn malformed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns the taxonomy class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. }
            | Self::Connection { .. }
            | Self::HttpStatus { .. }
            | Self::EmptyBody { .. }
            | Self::ClientBuild { .. }
            | Self::ProxyPoolExhausted { .. } => ErrorClass::Network,
            Self::Blocked { .. } => ErrorClass::Blocked,
            Self::MalformedResponse { .. } | Self::InvalidUrl { .. } => ErrorClass::Parse,
            Self::Io { .. } => ErrorClass::Disk,
            Self::ExhaustedRetries { last, .. } => last.class(),
        }
    }

    /// Whether the failure counts against the proxy that carried the request.
    #[must_use]
    pub fn is_proxy_attributable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Connection { .. }
                | Self::Blocked { .. }
                | Self::ClientBuild { .. }
        )
    }

    /// Whether this error (or the last attempt behind it) is pool exhaustion.
    #[must_use]
    pub fn is_pool_exhausted(&self) -> bool {
        match self {
            Self::ProxyPoolExhausted { .. } => true,
            Self::ExhaustedRetries { last, .. } => last.is_pool_exhausted(),
            _ => false,
        }
    }

    /// Server-mandated wait carried by a 429 response.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Blocked { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
