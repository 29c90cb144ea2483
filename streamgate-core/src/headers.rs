//! Per-service upstream request headers.
//!
//! Origins are picky about the requests they serve media to: each service
//! gets a generic browser-shaped default set merged with its own static
//! overrides, plus a cookie drawn from the store when one is available.

use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::config::NetworkConfig;
use crate::cookies::{Cookie, CookieStore};

/// Default headers applied to every upstream request.
const DEFAULT_HEADERS: &[(&str, &str)] = &[
    ("accept", "*/*"),
    ("accept-language", "en-US,en;q=0.5"),
    ("sec-fetch-mode", "navigate"),
];

/// Static per-service overrides layered on top of the defaults.
fn service_headers(service: &str) -> &'static [(&'static str, &'static str)] {
    match service {
        "youtube" | "youtube_oauth" => &[
            ("origin", "https://www.youtube.com"),
            ("referer", "https://www.youtube.com/"),
        ],
        "instagram" | "instagram_bearer" => &[
            ("origin", "https://www.instagram.com"),
            ("referer", "https://www.instagram.com/"),
            ("x-ig-app-id", "936619743392459"),
        ],
        "twitter" => &[("referer", "https://twitter.com/")],
        "reddit" => &[("referer", "https://www.reddit.com/")],
        "vimeo" | "vimeo_bearer" => &[("referer", "https://vimeo.com/")],
        _ => &[],
    }
}

/// Headers for one upstream request, plus the cookie that produced the
/// `Cookie` header so upstream refreshes can be folded back in.
#[derive(Debug, Default)]
pub struct RequestHeaders {
    pub map: HeaderMap,
    pub cookie: Option<Cookie>,
}

impl RequestHeaders {
    /// Renders the set as the CRLF-joined block the subprocess `-headers`
    /// flag expects.
    pub fn as_header_block(&self) -> String {
        self.map
            .iter()
            .filter_map(|(name, value)| {
                let value = value.to_str().ok()?;
                Some(format!("{name}: {value}\r\n"))
            })
            .collect()
    }
}

/// Builds the upstream header set for a service.
///
/// Pure aside from the store read: merges defaults with the service's
/// static overrides and injects a cookie when the store has one. YouTube
/// needs session continuity the most, so it tries the OAuth-flavored
/// cookie first and falls back to the standard one.
pub fn build_headers(
    store: &CookieStore,
    service: &str,
    network: &NetworkConfig,
) -> RequestHeaders {
    let mut map = HeaderMap::new();

    if let Ok(value) = HeaderValue::from_str(network.user_agent) {
        map.insert(axum::http::header::USER_AGENT, value);
    }
    for (name, value) in DEFAULT_HEADERS.iter().chain(service_headers(service)) {
        let Ok(name) = HeaderName::try_from(*name) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        map.insert(name, value);
    }

    let cookie = match service {
        "youtube" => store
            .get("youtube_oauth")
            .or_else(|_| store.get("youtube"))
            .ok(),
        _ => store.get(service).ok(),
    };

    if let Some(cookie) = &cookie {
        if !cookie.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
                map.insert(axum::http::header::COOKIE, value);
            }
        }
    } else {
        debug!(service, "no cookie available for upstream request");
    }

    RequestHeaders { map, cookie }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cookies::{ChannelBus, SyncMessage};

    fn store_with(service: &str, raw: &str) -> CookieStore {
        let store = CookieStore::with_cluster(Arc::new(ChannelBus::new()), false);
        store.handle_message(SyncMessage::Snapshot {
            cookies: [(service.to_string(), vec![raw.to_string()])]
                .into_iter()
                .collect(),
        });
        store
    }

    #[test]
    fn test_defaults_present_without_cookie() {
        let store = CookieStore::new();
        let headers = build_headers(&store, "reddit", &NetworkConfig::default());

        assert!(headers.map.contains_key("user-agent"));
        assert_eq!(headers.map.get("accept").unwrap(), "*/*");
        assert_eq!(
            headers.map.get("referer").unwrap(),
            "https://www.reddit.com/"
        );
        assert!(headers.map.get("cookie").is_none());
        assert!(headers.cookie.is_none());
    }

    #[test]
    fn test_cookie_injected_when_available() {
        let store = store_with("twitter", "auth_token=abc; ct0=def");
        let headers = build_headers(&store, "twitter", &NetworkConfig::default());

        assert_eq!(headers.map.get("cookie").unwrap(), "auth_token=abc; ct0=def");
        assert!(headers.cookie.is_some());
    }

    #[test]
    fn test_youtube_prefers_oauth_cookie() {
        let store = CookieStore::with_cluster(Arc::new(ChannelBus::new()), false);
        store.handle_message(SyncMessage::Snapshot {
            cookies: [
                ("youtube".to_string(), vec!["standard=1".to_string()]),
                ("youtube_oauth".to_string(), vec!["oauth=1".to_string()]),
            ]
            .into_iter()
            .collect(),
        });

        let headers = build_headers(&store, "youtube", &NetworkConfig::default());
        assert_eq!(headers.map.get("cookie").unwrap(), "oauth=1");
    }

    #[test]
    fn test_youtube_falls_back_to_standard_cookie() {
        let store = store_with("youtube", "standard=1");
        let headers = build_headers(&store, "youtube", &NetworkConfig::default());
        assert_eq!(headers.map.get("cookie").unwrap(), "standard=1");
    }

    #[test]
    fn test_header_block_is_crlf_joined() {
        let store = store_with("twitter", "auth_token=abc");
        let headers = build_headers(&store, "twitter", &NetworkConfig::default());
        let block = headers.as_header_block();
        assert!(block.contains("cookie: auth_token=abc\r\n"));
        assert!(block.contains("referer: https://twitter.com/\r\n"));
    }

    #[test]
    fn test_unknown_service_still_gets_defaults() {
        let store = CookieStore::new();
        let headers = build_headers(&store, "soundcloud", &NetworkConfig::default());
        assert!(headers.map.contains_key("user-agent"));
        assert!(headers.map.get("cookie").is_none());
    }
}
