//! Direct reverse-proxy delivery.
//!
//! The proxy path never touches the media bytes: it issues one upstream
//! request with the merged service header set, passes a bounded allow-list
//! of upstream response headers through, and folds any Set-Cookie refresh
//! back into the store before the body starts flowing.

use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::header;
use axum::response::Response;
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, warn};

use super::pipeline::content_disposition;
use super::registry::{UpstreamHandle, UpstreamRegistry};
use super::{ProxyPlan, TunnelError};
use crate::config::NetworkConfig;
use crate::cookies::CookieStore;
use crate::headers::build_headers;

/// Upstream response headers forwarded to the client verbatim.
const PASSTHROUGH_HEADERS: &[&str] = &[
    "content-length",
    "content-range",
    "accept-ranges",
    "content-type",
];

/// Builds the HTTP client used for proxy tunnels, with the redirect hop
/// bound from configuration.
///
/// # Errors
///
/// - `TunnelError::Upstream` - Client construction failed
pub fn proxy_client(network: &NetworkConfig) -> Result<reqwest::Client, TunnelError> {
    Ok(reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(network.max_redirects))
        .connect_timeout(network.connect_timeout)
        .build()?)
}

/// Merges the service header set with per-request overrides and the
/// client's range request.
fn upstream_request_headers(plan: &ProxyPlan, mut headers: HeaderMap) -> HeaderMap {
    for (name, value) in &plan.header_overrides {
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        headers.insert(name, value);
    }
    if let Some(range) = &plan.range {
        if let Ok(value) = HeaderValue::from_str(range) {
            headers.insert(header::RANGE, value);
        }
    }
    headers
}

/// Selects the client-facing response headers.
///
/// Everything outside the allow-list is dropped; a missing upstream
/// content type falls back to a guess from the filename.
fn response_headers(upstream: &HeaderMap, filename: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in PASSTHROUGH_HEADERS {
        if let Some(value) = upstream.get(*name) {
            if let Ok(name) = HeaderName::try_from(*name) {
                headers.insert(name, value.clone());
            }
        }
    }
    if !headers.contains_key(header::CONTENT_TYPE) {
        let mime = mime_guess::from_path(filename).first_or_octet_stream();
        if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
            headers.insert(header::CONTENT_TYPE, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&content_disposition(filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    headers.insert(
        HeaderName::from_static("cross-origin-resource-policy"),
        HeaderValue::from_static("cross-origin"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers
}

struct ReleaseGuard(Arc<dyn UpstreamHandle>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Streams one upstream URL straight through to the client.
///
/// # Errors
///
/// - `TunnelError::Upstream` - Request failed before any body byte
/// - `TunnelError::ResponseBuild` - Response could not be assembled
pub async fn proxy_tunnel(
    plan: &ProxyPlan,
    client: &reqwest::Client,
    store: &CookieStore,
    registry: &dyn UpstreamRegistry,
    network: &NetworkConfig,
) -> Result<Response, TunnelError> {
    let request_headers = build_headers(store, &plan.service, network);
    let mut cookie = request_headers.cookie;
    let headers = upstream_request_headers(plan, request_headers.map);

    let handle = registry.acquire(&plan.url);
    let upstream = match client.get(&plan.url).headers(headers).send().await {
        Ok(upstream) => upstream,
        Err(error) => {
            handle.release();
            return Err(TunnelError::Upstream(error));
        }
    };

    // Fold any cookie refresh back before the body starts flowing.
    if let Some(cookie) = &mut cookie {
        let refreshed: Vec<String> = upstream
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect();
        if !refreshed.is_empty() {
            match store.apply_upstream_response(cookie, &refreshed) {
                Ok(true) => debug!(service = %plan.service, "cookie refreshed from upstream"),
                Ok(false) => {}
                Err(error) => warn!(%error, "failed to apply upstream cookie refresh"),
            }
        }
    }

    let status = upstream.status();
    let headers = response_headers(upstream.headers(), &plan.filename);

    let state = (upstream.bytes_stream(), ReleaseGuard(handle));
    let stream = futures::stream::unfold(state, |mut state| async move {
        match state.0.next().await {
            Some(Ok(chunk)) => Some((Ok::<Bytes, std::io::Error>(chunk), state)),
            Some(Err(error)) => {
                warn!(%error, "upstream stream ended with error");
                None
            }
            None => None,
        }
    });

    let mut builder = Response::builder().status(status);
    if let Some(map) = builder.headers_mut() {
        map.extend(headers);
    }
    builder
        .body(Body::from_stream(stream))
        .map_err(|error| TunnelError::ResponseBuild {
            reason: error.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> ProxyPlan {
        ProxyPlan {
            service: "twitter".to_string(),
            url: "https://video.example/clip".to_string(),
            filename: "clip.mp4".to_string(),
            range: None,
            header_overrides: Vec::new(),
        }
    }

    #[test]
    fn test_overrides_and_range_are_merged() {
        let mut plan = plan();
        plan.range = Some("bytes=100-".to_string());
        plan.header_overrides = vec![
            ("referer".to_string(), "https://other.example/".to_string()),
            ("bad header".to_string(), "dropped".to_string()),
        ];

        let mut base = HeaderMap::new();
        base.insert(header::REFERER, HeaderValue::from_static("https://x/"));

        let merged = upstream_request_headers(&plan, base);
        assert_eq!(merged.get("referer").unwrap(), "https://other.example/");
        assert_eq!(merged.get("range").unwrap(), "bytes=100-");
        assert!(merged.get("bad header").is_none());
    }

    #[test]
    fn test_response_headers_pass_allow_list_only() {
        let mut upstream = HeaderMap::new();
        upstream.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_static("123456"),
        );
        upstream.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_static("bytes 0-99/123456"),
        );
        upstream.insert(header::SET_COOKIE, HeaderValue::from_static("sid=abc"));
        upstream.insert(
            HeaderName::from_static("x-upstream-internal"),
            HeaderValue::from_static("leak"),
        );

        let headers = response_headers(&upstream, "clip.mp4");
        assert_eq!(headers.get("content-length").unwrap(), "123456");
        assert_eq!(headers.get("content-range").unwrap(), "bytes 0-99/123456");
        assert!(headers.get("set-cookie").is_none());
        assert!(headers.get("x-upstream-internal").is_none());
        assert_eq!(
            headers.get("cross-origin-resource-policy").unwrap(),
            "cross-origin"
        );
        assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
    }

    #[test]
    fn test_missing_content_type_guessed_from_filename() {
        let headers = response_headers(&HeaderMap::new(), "track.mp3");
        assert_eq!(headers.get("content-type").unwrap(), "audio/mpeg");
        let disposition = headers
            .get("content-disposition")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(disposition.contains("track.mp3"));
    }
}
