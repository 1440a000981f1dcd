//! Error types for the download module.

use std::path::PathBuf;

use thiserror::Error;

use crate::error::ErrorClass;
use crate::fetch::FetchError;

/// Terminal failure of one item download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The item carries no download reference.
    #[error("item {item_id} has no download reference")]
    MissingReference {
        /// The item without a reference.
        item_id: String,
    },

    /// Retrieval failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Local filesystem error (directory creation, rename).
    #[error("IO error at {path}: {source}")]
    Disk {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl DownloadError {
    /// Creates a [`DownloadError::Disk`] for `path`.
    pub fn disk(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Disk {
            path: path.into(),
            source,
        }
    }

    /// Returns the taxonomy class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MissingReference { .. } => ErrorClass::Parse,
            Self::Fetch(e) => e.class(),
            Self::Disk { .. } => ErrorClass::Disk,
        }
    }

    /// Whether the download failed because no egress was left.
    #[must_use]
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Self::Fetch(e) if e.is_pool_exhausted())
    }
}
