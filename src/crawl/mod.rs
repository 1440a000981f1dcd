//! Catalog and listing crawlers.
//!
//! - [`EntityCrawler`] paginates the entity catalog.
//! - [`ItemCrawler`] walks each entity's listing and merges items into the
//!   item store.
//! - [`Extractor`] is the seam to site-specific markup.

mod entity;
mod extract;
mod item;

use thiserror::Error;

pub use entity::{CrawlReport, EntityCrawler, NameFilter};
pub use extract::{ExtractError, Extractor, Listing, RegexExtractor, SiteLayout};
pub use item::{ItemCrawler, MergeReport};

use crate::error::ErrorClass;
use crate::fetch::FetchError;

/// Failure of a single page: either the fetch or the extraction.
#[derive(Debug, Error)]
pub enum PageError {
    /// The page could not be retrieved.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// The page could not be interpreted.
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

impl PageError {
    /// Returns the taxonomy class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Fetch(e) => e.class(),
            Self::Extract(e) => e.class(),
        }
    }

    /// Whether the page failed because no egress was left.
    #[must_use]
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Self::Fetch(e) if e.is_pool_exhausted())
    }
}
