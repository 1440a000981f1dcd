//! Error types for persisted documents.

use std::path::PathBuf;

use thiserror::Error;

use crate::error::ErrorClass;

/// Errors reading or writing a persisted document.
#[derive(Debug, Error)]
pub enum StoreError {
    /// File system error.
    #[error("IO error on {path}: {source}")]
    Io {
        /// Document path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid JSON for its schema.
    #[error("invalid document {path}: {source}")]
    Json {
        /// Document path.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a JSON error.
    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }

    /// Store failures are always disk-class.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Disk
    }
}
