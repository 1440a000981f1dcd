//! Network retrieval with retry, backoff, identity rotation, and throttling.
//!
//! # Overview
//!
//! - [`Fetcher`] - one logical retrieval per call, attempts routed through
//!   the proxy pool
//! - [`RetryPolicy`] - the backoff policy shared with the download manager
//! - [`Throttle`] - randomized per-host spacing between requests
//! - [`FetchError`] - error type with taxonomy classification

mod client;
mod error;
mod fetcher;
mod retry;
mod throttle;

pub(crate) use client::build_client;
pub use error::FetchError;
pub use fetcher::{FetchOptions, Fetcher, Payload};
pub use retry::{DEFAULT_MAX_ATTEMPTS, FailureType, RetryDecision, RetryPolicy, classify_error};
pub use throttle::{Throttle, extract_host, parse_retry_after};
