//! Best-effort content-length prediction for tunneled responses.
//!
//! A processed stream has no knowable exact length before the subprocess
//! finishes, but clients want progress bars. Each upstream input is probed
//! for its size; the sum is corrected by the driver's estimate multiplier.
//! The result is advisory only and travels in the non-standard
//! `Estimated-Content-Length` header, with `-1` meaning unknown.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

/// Value carried by `Estimated-Content-Length` when nothing is known.
pub const LENGTH_UNKNOWN: i64 = -1;

/// Probes an upstream URL for its expected byte length.
///
/// Implementations must be bounded by their own timeout; a slow origin
/// degrades the estimate, never the response.
#[async_trait]
pub trait LengthProbe: Send + Sync {
    /// Returns the expected size in bytes, or None when unknown.
    async fn probe(&self, url: &str) -> Option<u64>;
}

/// Production probe issuing a HEAD request per URL.
pub struct HttpLengthProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpLengthProbe {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl LengthProbe for HttpLengthProbe {
    async fn probe(&self, url: &str) -> Option<u64> {
        let response = self
            .client
            .head(url)
            .timeout(self.timeout)
            .send()
            .await
            .ok()?;

        let length = response.content_length().or_else(|| {
            response
                .headers()
                .get(axum::http::header::CONTENT_LENGTH)?
                .to_str()
                .ok()?
                .parse()
                .ok()
        });

        debug!(url, ?length, "length probe completed");
        length
    }
}

/// Combines probed input sizes into one estimate.
///
/// Known sizes are summed. When at least one input's size is missing but
/// another is known, the known sum is doubled - for the common merge case
/// (one video, one audio input) a missing track is assumed to be no larger
/// than the one we can see. Returns [`LENGTH_UNKNOWN`] when nothing is
/// known. Zero-byte probe results count as unknown.
pub fn estimate_total(sizes: &[Option<u64>], multiplier: f64) -> i64 {
    let known: Vec<u64> = sizes
        .iter()
        .filter_map(|size| size.filter(|s| *s > 0))
        .collect();

    if known.is_empty() {
        return LENGTH_UNKNOWN;
    }

    let mut sum: u64 = known.iter().sum();
    if known.len() < sizes.len() {
        sum *= 2;
    }

    (sum as f64 * multiplier) as i64
}

/// Probes every URL and combines the results.
pub async fn estimate_for_urls(
    probe: &dyn LengthProbe,
    urls: &[String],
    multiplier: f64,
) -> i64 {
    let probes = urls.iter().map(|url| probe.probe(url));
    let sizes: Vec<Option<u64>> = futures::future::join_all(probes).await;
    estimate_total(&sizes, multiplier)
}
