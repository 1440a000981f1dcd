//! HTTP client construction.

use std::time::Duration;

use reqwest::{Client, Proxy};

use crate::user_agent;

/// Builds a client that connects through `proxy_url`, or directly when `None`.
///
/// Direct clients ignore system proxy settings so that "direct" means direct.
/// The per-request timeout is applied by the caller.
pub(crate) fn build_client(
    proxy_url: Option<&str>,
    connect_timeout: Duration,
) -> Result<Client, reqwest::Error> {
    let builder = Client::builder()
        .connect_timeout(connect_timeout)
        .gzip(true)
        .default_headers(user_agent::default_headers())
        .user_agent(user_agent::BROWSER_USER_AGENTS[0]);

    match proxy_url {
        Some(url) => builder.proxy(Proxy::all(url)?).build(),
        None => builder.no_proxy().build(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_direct_client() {
        assert!(build_client(None, Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_build_proxied_clients() {
        for url in ["http://127.0.0.1:8080", "socks5://127.0.0.1:1080"] {
            assert!(build_client(Some(url), Duration::from_secs(5)).is_ok(), "{url}");
        }
    }
}
