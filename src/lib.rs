//! Harvester Core Library
//!
//! This library provides the crawl-and-download engine behind the `harvester`
//! tool: it discovers a catalog of producers ("entities") on a remote site,
//! collects the items each one publishes, merges them into a persisted store,
//! and downloads the referenced assets.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`config`] - `config.json` loading and validation
//! - [`policy`] - Throughput vs. cautious posture resolution
//! - [`proxy`] - Proxy pool with health probing and quarantine
//! - [`fetch`] - Retrying fetch layer with throttling and identity rotation
//! - [`crawl`] - Entity catalog and item listing crawlers
//! - [`store`] - Persisted entity/item documents and recency caches
//! - [`download`] - Resumable concurrent asset downloads
//! - [`harvester`] - Operation entry points used by front ends

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod crawl;
pub mod download;
pub mod error;
pub mod fetch;
pub mod harvester;
pub mod policy;
pub mod proxy;
pub mod store;
mod user_agent;

// Re-export commonly used types
pub use config::{AppConfig, ConfigError, ProxyConfig};
pub use crawl::{CrawlReport, EntityCrawler, Extractor, ItemCrawler, MergeReport, NameFilter};
pub use download::{DownloadManager, DownloadReport, NoopObserver, ProgressEvent, ProgressObserver};
pub use error::{ErrorClass, Failure, HarvestError};
pub use fetch::{FetchError, FetchOptions, Fetcher, Payload, RetryPolicy};
pub use harvester::{Harvester, RunOptions};
pub use policy::{DelayRange, EffectivePolicy, Mode, Overrides, PolicyResolver, ProxyUsage};
pub use proxy::{Outcome, PoolStatus, ProxyHandle, ProxyPool, ProxyRecord};
pub use store::{AggregateStats, Entity, Item};
