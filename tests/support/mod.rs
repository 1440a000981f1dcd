//! Shared fixtures for integration tests: fast policies, direct fetchers, and
//! mock site pages.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use harvester_core::policy::{DelayRange, EffectivePolicy, Mode, Overrides, PolicyResolver, ProxyUsage};
use harvester_core::{Entity, Fetcher, Item, ProxyPool};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Throughput policy with no inter-request delay and millisecond backoff.
pub fn fast_policy(workers: usize, max_attempts: u32) -> EffectivePolicy {
    PolicyResolver::new(16, Duration::from_secs(5), Duration::from_secs(30))
        .expect("valid resolver")
        .resolve(
            Mode::Throughput,
            &Overrides {
                max_workers: Some(workers),
                max_attempts: Some(max_attempts),
                request_delay: Some(DelayRange::ZERO),
                retry_base_delay: Some(Duration::from_millis(5)),
                retry_max_delay: Some(Duration::from_millis(20)),
                retry_jitter: Some(Duration::ZERO),
                proxy_usage: Some(ProxyUsage::Direct),
                ..Overrides::default()
            },
        )
        .expect("valid policy")
}

/// Same as [`fast_policy`], but every attempt goes through the proxy pool.
pub fn rotating_policy(workers: usize, max_attempts: u32) -> EffectivePolicy {
    let mut policy = fast_policy(workers, max_attempts);
    policy.proxy_usage = ProxyUsage::Rotate;
    policy
}

/// Fetcher that always connects directly.
pub fn direct_fetcher(policy: &EffectivePolicy) -> Arc<Fetcher> {
    Arc::new(Fetcher::new(Arc::new(ProxyPool::direct()), policy))
}

/// Catalog page markup linking the given `(id, name)` singers.
pub fn catalog_page(entities: &[(&str, &str)], last_page: Option<u32>) -> String {
    let mut html = String::from("<html><body><ul class=\"singers\">");
    for (id, name) in entities {
        html.push_str(&format!(r#"<li><a href="/singer/{id}/1.html">{name}</a></li>"#));
    }
    html.push_str("</ul>");
    if let Some(last) = last_page {
        html.push_str("<div class=\"pages\">");
        for page in 1..=last {
            html.push_str(&format!(r#"<a href="/singers/index/index/{page}.html">{page}</a>"#));
        }
        html.push_str("</div>");
    }
    html.push_str("</body></html>");
    html
}

/// Listing page markup for `entity_id` linking the given `(id, title)` songs.
pub fn listing_page(entity_id: &str, items: &[(&str, &str)], last_page: Option<u32>) -> String {
    let mut html = String::from("<html><body><ul class=\"songs\">");
    for (id, title) in items {
        html.push_str(&format!(r#"<li><a href="/mp3/{id}.html" target="_blank">{title}</a></li>"#));
    }
    html.push_str("</ul>");
    if let Some(last) = last_page {
        for page in 1..=last {
            html.push_str(&format!(r#"<a href="/singer/{entity_id}/{page}.html">{page}</a>"#));
        }
    }
    html.push_str("</body></html>");
    html
}

/// Serves `body` as HTML at `route`.
pub async fn serve_page(server: &MockServer, route: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

/// An entity hosted on `base`.
pub fn entity(base: &str, id: &str, name: &str) -> Entity {
    Entity {
        id: id.to_string(),
        name: name.to_string(),
        url: format!("{base}/singer/{id}/1.html"),
        base_url: format!("{base}/singer/{id}"),
    }
}

/// An item whose asset is served at `{base}/files/{id}.mp3`.
pub fn item(base: &str, id: &str, singer: &str, title: &str) -> Item {
    Item {
        id: id.to_string(),
        title: title.to_string(),
        source_url: format!("{base}/mp3/{id}.html"),
        entity_id: format!("e-{singer}"),
        entity_name: singer.to_string(),
        download_reference: format!("{base}/files/{id}.mp3"),
        size_hint: None,
        duration_hint: None,
    }
}
