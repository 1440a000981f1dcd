//! Listing page extraction.
//!
//! The crawlers never look at markup themselves; they hand page bodies to an
//! [`Extractor`] and work with the records it returns. [`RegexExtractor`] is
//! the default implementation, driven by a [`SiteLayout`] describing the
//! site's URL scheme.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use url::Url;

use crate::error::ErrorClass;
use crate::store::{Entity, Item};

/// Placeholder for the page number in path templates.
const PAGE_PLACEHOLDER: &str = "{page}";

/// Placeholder for an entity or item id in path templates.
const ID_PLACEHOLDER: &str = "{id}";

/// Matches an anchor element, capturing the href and the inner markup.
#[allow(clippy::expect_used)]
static ANCHOR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\s[^>]*?href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a\s*>"#)
        .expect("anchor regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("tag regex is valid"));

#[allow(clippy::expect_used)]
static NUMERIC_ENTITY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);").expect("numeric entity regex is valid")
});

/// Errors raised while extracting records from a page.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The page body was blank.
    #[error("page body is empty")]
    EmptyPage,

    /// A layout pattern did not compile.
    #[error("invalid {name} pattern '{pattern}': {source}")]
    InvalidPattern {
        /// Which layout pattern.
        name: &'static str,
        /// The pattern text.
        pattern: String,
        /// Underlying regex error.
        #[source]
        source: regex::Error,
    },

    /// The layout base URL did not parse.
    #[error("invalid base URL '{url}'")]
    InvalidBaseUrl {
        /// The base URL.
        url: String,
    },
}

impl ExtractError {
    /// Returns the taxonomy class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::EmptyPage => ErrorClass::Parse,
            Self::InvalidPattern { .. } | Self::InvalidBaseUrl { .. } => ErrorClass::Config,
        }
    }
}

/// Which kind of listing a page belongs to, for pagination discovery.
#[derive(Debug, Clone, Copy)]
pub enum Listing<'a> {
    /// The entity catalog.
    Catalog,
    /// One entity's item listing.
    Entity(&'a Entity),
}

/// Turns listing pages into records.
pub trait Extractor: Send + Sync {
    /// URL of catalog page `page` (1-indexed).
    fn catalog_url(&self, page: u32) -> String;

    /// URL of page `page` (1-indexed) of `entity`'s item listing.
    fn entity_page_url(&self, entity: &Entity, page: u32) -> String;

    /// Entities linked from a catalog page, deduplicated by id.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError`] when the page cannot be interpreted at all.
    fn entities(&self, page: &str) -> Result<Vec<Entity>, ExtractError>;

    /// Items linked from one of `entity`'s listing pages, deduplicated by id.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError`] when the page cannot be interpreted at all.
    fn items(&self, page: &str, entity: &Entity) -> Result<Vec<Item>, ExtractError>;

    /// Highest page number linked from a page of `listing`, if any.
    fn max_page(&self, page: &str, listing: Listing<'_>) -> Option<u32>;
}

/// URL scheme of the target site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteLayout {
    /// Site root, without trailing slash.
    pub base_url: String,
    /// Catalog page path, with `{page}`.
    pub catalog_path: String,
    /// Entity listing path, with `{id}` and `{page}`.
    pub entity_path: String,
    /// Regex for entity links; group 1 is the entity id.
    pub entity_link: String,
    /// Regex for item links; group 1 is the item id.
    pub item_link: String,
    /// Download path, with `{id}`.
    pub download_template: String,
}

impl SiteLayout {
    /// The default layout rooted at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            catalog_path: "/singers/index/index/{page}.html".to_string(),
            entity_path: "/singer/{id}/{page}.html".to_string(),
            entity_link: r"/singer/(\d+)/\d+\.html".to_string(),
            item_link: r"/mp3/([a-f0-9]+)\.html".to_string(),
            download_template: "/plug/down.php?ac=music&id={id}".to_string(),
        }
    }
}

/// Regex-based extractor for a [`SiteLayout`].
#[derive(Debug, Clone)]
pub struct RegexExtractor {
    layout: SiteLayout,
    base: Url,
    entity_link: Regex,
    item_link: Regex,
    catalog_page_link: Regex,
}

impl RegexExtractor {
    /// Compiles the layout's patterns.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError`] if the base URL or a pattern is invalid.
    pub fn new(layout: SiteLayout) -> Result<Self, ExtractError> {
        let base = Url::parse(&format!("{}/", layout.base_url)).map_err(|_| {
            ExtractError::InvalidBaseUrl {
                url: layout.base_url.clone(),
            }
        })?;
        let entity_link = compile("entity link", &layout.entity_link)?;
        let item_link = compile("item link", &layout.item_link)?;
        let catalog_page_link = compile("catalog page", &page_pattern(&layout.catalog_path))?;

        Ok(Self {
            layout,
            base,
            entity_link,
            item_link,
            catalog_page_link,
        })
    }

    /// Returns the layout this extractor was built from.
    #[must_use]
    pub fn layout(&self) -> &SiteLayout {
        &self.layout
    }

    fn absolute(&self, href: &str) -> String {
        self.base
            .join(href)
            .map_or_else(|_| href.to_string(), String::from)
    }

    fn entity_root(&self, id: &str) -> String {
        let path = self
            .layout
            .entity_path
            .split(&format!("/{PAGE_PLACEHOLDER}"))
            .next()
            .unwrap_or_default()
            .replace(ID_PLACEHOLDER, id);
        format!("{}{path}", self.layout.base_url)
    }
}

fn compile(name: &'static str, pattern: &str) -> Result<Regex, ExtractError> {
    Regex::new(pattern).map_err(|source| ExtractError::InvalidPattern {
        name,
        pattern: pattern.to_string(),
        source,
    })
}

/// Turns a path template into a regex capturing the page number.
fn page_pattern(template: &str) -> String {
    regex::escape(template).replace(&regex::escape(PAGE_PLACEHOLDER), r"(\d+)")
}

fn ensure_not_blank(page: &str) -> Result<(), ExtractError> {
    if page.trim().is_empty() {
        Err(ExtractError::EmptyPage)
    } else {
        Ok(())
    }
}

/// Iterates `(href, text)` for every anchor in `page`.
fn anchors(page: &str) -> impl Iterator<Item = (&str, String)> {
    ANCHOR_PATTERN.captures_iter(page).filter_map(|caps| {
        let href = caps.get(1)?.as_str();
        let text = caps.get(2).map_or("", |m| m.as_str());
        Some((href, link_text(text)))
    })
}

/// Strips tags, decodes common entities, and collapses whitespace.
fn link_text(markup: &str) -> String {
    let stripped = TAG_PATTERN.replace_all(markup, "");
    let decoded = decode_entities(&stripped);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_entities(text: &str) -> String {
    let named = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'");
    let numeric = NUMERIC_ENTITY_PATTERN.replace_all(&named, |caps: &regex::Captures<'_>| {
        let raw = &caps[1];
        let code = match raw.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => raw.parse::<u32>().ok(),
        };
        code.and_then(char::from_u32)
            .map_or_else(|| caps[0].to_string(), String::from)
    });
    // Last so "&amp;lt;" stays "&lt;".
    numeric.replace("&amp;", "&")
}

/// Keeps one record per id, preferring the longer label; first-seen order.
pub(super) fn dedup_longest<T>(
    records: impl IntoIterator<Item = T>,
    id: impl Fn(&T) -> &str,
    label: impl Fn(&T) -> &str,
) -> Vec<T> {
    let mut out: Vec<T> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for record in records {
        match index.get(id(&record)) {
            Some(&pos) => {
                if label(&record).chars().count() > label(&out[pos]).chars().count() {
                    out[pos] = record;
                }
            }
            None => {
                index.insert(id(&record).to_string(), out.len());
                out.push(record);
            }
        }
    }
    out
}

fn max_capture(pattern: &Regex, page: &str) -> Option<u32> {
    pattern
        .captures_iter(page)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u32>().ok())
        .max()
}

impl Extractor for RegexExtractor {
    fn catalog_url(&self, page: u32) -> String {
        format!(
            "{}{}",
            self.layout.base_url,
            self.layout
                .catalog_path
                .replace(PAGE_PLACEHOLDER, &page.to_string())
        )
    }

    fn entity_page_url(&self, entity: &Entity, page: u32) -> String {
        format!(
            "{}{}",
            self.layout.base_url,
            self.layout
                .entity_path
                .replace(ID_PLACEHOLDER, &entity.id)
                .replace(PAGE_PLACEHOLDER, &page.to_string())
        )
    }

    fn entities(&self, page: &str) -> Result<Vec<Entity>, ExtractError> {
        ensure_not_blank(page)?;

        let found = anchors(page).filter_map(|(href, name)| {
            let id = self.entity_link.captures(href)?.get(1)?.as_str().to_string();
            Some(Entity {
                url: self.absolute(href),
                base_url: self.entity_root(&id),
                id,
                name,
            })
        });

        let mut entities = dedup_longest(found, |e| e.id.as_str(), |e| e.name.as_str());
        entities.retain(|e| !e.name.is_empty());
        Ok(entities)
    }

    fn items(&self, page: &str, entity: &Entity) -> Result<Vec<Item>, ExtractError> {
        ensure_not_blank(page)?;

        let found = anchors(page).filter_map(|(href, title)| {
            let id = self.item_link.captures(href)?.get(1)?.as_str().to_string();
            Some(Item {
                source_url: self.absolute(href),
                download_reference: format!(
                    "{}{}",
                    self.layout.base_url,
                    self.layout.download_template.replace(ID_PLACEHOLDER, &id)
                ),
                entity_id: entity.id.clone(),
                entity_name: entity.name.clone(),
                id,
                title,
                size_hint: None,
                duration_hint: None,
            })
        });

        let mut items = dedup_longest(found, |i| i.id.as_str(), |i| i.title.as_str());
        items.retain(|i| !i.title.is_empty());
        Ok(items)
    }

    fn max_page(&self, page: &str, listing: Listing<'_>) -> Option<u32> {
        match listing {
            Listing::Catalog => max_capture(&self.catalog_page_link, page),
            Listing::Entity(entity) => {
                let template = self
                    .layout
                    .entity_path
                    .replace(ID_PLACEHOLDER, &entity.id);
                let pattern = Regex::new(&page_pattern(&template)).ok()?;
                max_capture(&pattern, page)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn extractor() -> RegexExtractor {
        RegexExtractor::new(SiteLayout::new("https://music.example.com/")).unwrap()
    }

    fn entity(id: &str, name: &str) -> Entity {
        Entity {
            id: id.to_string(),
            name: name.to_string(),
            url: format!("https://music.example.com/singer/{id}/1.html"),
            base_url: format!("https://music.example.com/singer/{id}"),
        }
    }

    // ==================== URL Builder Tests ====================

    #[test]
    fn test_catalog_and_entity_urls() {
        let x = extractor();
        assert_eq!(
            x.catalog_url(3),
            "https://music.example.com/singers/index/index/3.html"
        );
        assert_eq!(
            x.entity_page_url(&entity("42", "A"), 2),
            "https://music.example.com/singer/42/2.html"
        );
    }

    // ==================== Entity Extraction Tests ====================

    #[test]
    fn test_entities_from_catalog_page() {
        let page = r#"
            <ul>
              <li><a href="/singer/101/1.html"><img src="a.jpg"></a></li>
              <li><a href="/singer/101/1.html" title="x">Jay &amp; Friends</a></li>
              <li><a class="n" href='https://music.example.com/singer/202/1.html'><span>Faye</span></a></li>
              <li><a href="/about.html">About</a></li>
            </ul>"#;

        let entities = extractor().entities(page).unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].id, "101");
        assert_eq!(entities[0].name, "Jay & Friends");
        assert_eq!(entities[0].url, "https://music.example.com/singer/101/1.html");
        assert_eq!(entities[0].base_url, "https://music.example.com/singer/101");
        assert_eq!(entities[1].name, "Faye");
    }

    #[test]
    fn test_entities_dedup_keeps_longer_name() {
        let page = r#"<a href="/singer/7/1.html">Li</a><a href="/singer/7/2.html">Li Jian</a>"#;
        let entities = extractor().entities(page).unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].name, "Li Jian");
    }

    #[test]
    fn test_entities_blank_page_is_error() {
        assert!(matches!(
            extractor().entities("   \n"),
            Err(ExtractError::EmptyPage)
        ));
    }

    #[test]
    fn test_entities_page_without_links_is_empty() {
        assert!(extractor().entities("<html><body>none</body></html>").unwrap().is_empty());
    }

    // ==================== Item Extraction Tests ====================

    #[test]
    fn test_items_build_download_reference() {
        let page = r#"
            <a href="/mp3/abc123.html">Song &#x4E00; One</a>
            <a href="/mp3/abc123.html">Song</a>
            <a href="/mp3/def456.html"></a>
            <a href="/mp3/0f0f.html"><b>Second</b>&nbsp;Song</a>"#;

        let owner = entity("42", "Singer");
        let items = extractor().items(page, &owner).unwrap();

        assert_eq!(items.len(), 2, "empty titles are dropped");
        assert_eq!(items[0].id, "abc123");
        assert_eq!(items[0].title, "Song \u{4E00} One");
        assert_eq!(
            items[0].download_reference,
            "https://music.example.com/plug/down.php?ac=music&id=abc123"
        );
        assert_eq!(items[0].source_url, "https://music.example.com/mp3/abc123.html");
        assert_eq!(items[0].entity_id, "42");
        assert_eq!(items[0].entity_name, "Singer");
        assert_eq!(items[1].title, "Second Song");
    }

    // ==================== Pagination Tests ====================

    #[test]
    fn test_catalog_max_page() {
        let page = r#"
            <div class="pager">
              <a href="/singers/index/index/2.html">2</a>
              <a href="/singers/index/index/17.html">last</a>
              <a href="/singers/index/index/3.html">3</a>
            </div>"#;
        assert_eq!(extractor().max_page(page, Listing::Catalog), Some(17));
    }

    #[test]
    fn test_entity_max_page_ignores_other_entities() {
        let owner = entity("42", "Singer");
        let page = r#"
            <a href="/singer/42/2.html">2</a>
            <a href="/singer/42/5.html">5</a>
            <a href="/singer/99/40.html">other</a>"#;
        assert_eq!(extractor().max_page(page, Listing::Entity(&owner)), Some(5));
    }

    #[test]
    fn test_max_page_absent() {
        assert_eq!(extractor().max_page("<p>no pager</p>", Listing::Catalog), None);
    }

    // ==================== Text Tests ====================

    #[test]
    fn test_decode_entities() {
        assert_eq!(decode_entities("a &lt;b&gt; &quot;c&quot; &#65;"), "a <b> \"c\" A");
        assert_eq!(decode_entities("&amp;lt;"), "&lt;");
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let mut layout = SiteLayout::new("https://music.example.com");
        layout.item_link = "(".to_string();
        assert!(matches!(
            RegexExtractor::new(layout),
            Err(ExtractError::InvalidPattern { name: "item link", .. })
        ));
    }
}
