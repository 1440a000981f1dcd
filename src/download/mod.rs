//! Resumable concurrent downloads of item assets.
//!
//! # Features
//!
//! - Deterministic target paths, so finished files are recognized across runs
//! - Skip rule: files already on disk and recent download index entries
//! - Streaming into a `.part` file with atomic rename on success
//! - Per-item retry with backoff on top of the fetcher's own retries
//! - Incremental progress through [`ProgressObserver`]

mod engine;
mod error;
mod filename;
mod progress;

pub use engine::{DownloadManager, DownloadReport};
pub use error::DownloadError;
pub use filename::{
    DEFAULT_EXTENSION, KNOWN_EXTENSIONS, disambiguated_stem, existing_at_stem, existing_download,
    extension_from_url, partial_path, path_for_stem, sanitize_component, target_path, target_stem,
};
pub use progress::{NoopObserver, ProgressEvent, ProgressObserver};
