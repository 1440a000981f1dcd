//! Deterministic local paths for downloaded items.
//!
//! An item always maps to `dir/<entity>/<entity> - <title><ext>`, which is
//! what makes the skip rule work across restarts.

use std::path::{Path, PathBuf};

use url::Url;

use crate::store::Item;

/// Audio extensions recognized by the skip rule, in lookup order.
pub const KNOWN_EXTENSIONS: [&str; 5] = [".mp3", ".wav", ".flac", ".m4a", ".aac"];

/// Extension used when the download URL does not name a known one.
pub const DEFAULT_EXTENSION: &str = ".mp3";

/// Maximum length of a sanitized path component, in characters.
const MAX_COMPONENT_CHARS: usize = 200;

/// Suffix of the temporary file a download streams into.
const PARTIAL_SUFFIX: &str = ".part";

/// Makes `value` safe as a single path component.
///
/// Reserved characters (`< > : " / \ | ? *`) and control characters become
/// `_`; the result is trimmed and cut to 200 characters. Blank or dot-only
/// input becomes `_`.
#[must_use]
pub fn sanitize_component(value: &str) -> String {
    let mapped: String = value
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let truncated: String = mapped.trim().chars().take(MAX_COMPONENT_CHARS).collect();
    let trimmed = truncated.trim_end();

    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Known audio extension named by the URL path, lowercased with the dot.
#[must_use]
pub fn extension_from_url(url: &str) -> Option<&'static str> {
    let parsed = Url::parse(url).ok()?;
    let last_segment = parsed.path_segments()?.next_back()?;
    let dot_index = last_segment.rfind('.')?;
    let ext = last_segment[dot_index..].to_lowercase();
    KNOWN_EXTENSIONS.into_iter().find(|known| *known == ext)
}

/// Path stem shared by every extension variant of `item`.
#[must_use]
pub fn target_stem(dir: &Path, item: &Item) -> PathBuf {
    let entity = sanitize_component(&item.entity_name);
    let title = sanitize_component(&item.title);
    dir.join(&entity).join(format!("{entity} - {title}"))
}

/// Stem for an item whose [`target_stem`] is already taken by another item
/// of the same batch: the item id is appended as `<title> [<id>]`.
#[must_use]
pub fn disambiguated_stem(dir: &Path, item: &Item) -> PathBuf {
    let entity = sanitize_component(&item.entity_name);
    let title = sanitize_component(&item.title);
    let id = sanitize_component(&item.id);
    dir.join(&entity).join(format!("{entity} - {title} [{id}]"))
}

fn with_extension(stem: &Path, ext: &str) -> PathBuf {
    let mut name = stem.as_os_str().to_owned();
    name.push(ext);
    PathBuf::from(name)
}

/// Final path of `item` under `dir`.
#[must_use]
pub fn target_path(dir: &Path, item: &Item) -> PathBuf {
    path_for_stem(&target_stem(dir, item), item)
}

/// Final path of `item` for an explicit `stem`.
#[must_use]
pub fn path_for_stem(stem: &Path, item: &Item) -> PathBuf {
    let ext = extension_from_url(&item.download_reference).unwrap_or(DEFAULT_EXTENSION);
    with_extension(stem, ext)
}

/// Temporary path a download of `target` streams into.
#[must_use]
pub fn partial_path(target: &Path) -> PathBuf {
    with_extension(target, PARTIAL_SUFFIX)
}

/// An already downloaded, non-empty file for `item` with any known extension.
pub async fn existing_download(dir: &Path, item: &Item) -> Option<PathBuf> {
    existing_at_stem(&target_stem(dir, item)).await
}

/// A non-empty file at `stem` with any known extension.
pub async fn existing_at_stem(stem: &Path) -> Option<PathBuf> {
    for ext in KNOWN_EXTENSIONS {
        let candidate = with_extension(stem, ext);
        if let Ok(meta) = tokio::fs::metadata(&candidate).await
            && meta.is_file()
            && meta.len() > 0
        {
            return Some(candidate);
        }
    }
    None
}
