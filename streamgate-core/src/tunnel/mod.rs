//! Tunnel delivery: the data path carrying media bytes to the client.
//!
//! An inbound delivery request arrives as a [`StreamDescriptor`] and is
//! validated at the boundary into a closed [`TunnelPlan`]: either a direct
//! reverse-proxy of one upstream stream, or a subprocess transformation
//! (container remux, audio transcode, GIF transcode) whose output pipe is
//! wired into the HTTP response.

pub mod args;
pub mod pipeline;
pub mod proxy;
pub mod registry;

use std::collections::BTreeMap;
use std::io;

use serde::Deserialize;

pub use args::{FfmpegJob, build_audio_args, build_gif_args, build_remux_args};
pub use pipeline::{
    PipelineStatus, RunningPipeline, ShutdownGuard, content_disposition, run_pipeline,
    spawn_pipeline,
};
pub use proxy::{proxy_client, proxy_tunnel};
pub use registry::{CountingRegistry, TunnelRegistry, UpstreamHandle, UpstreamRegistry};

/// Errors that can occur while setting up or running a tunnel.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// URL count does not match the delivery kind.
    #[error("Expected {expected} input URLs, got {got}")]
    WrongInputCount { expected: usize, got: usize },

    /// Metadata tag is not on the allow-list.
    #[error("Unsupported metadata tag: {tag}")]
    UnsupportedMetadataTag { tag: String },

    /// Output filename has no usable container extension.
    #[error("Unsupported output format: {format}")]
    UnsupportedFormat { format: String },

    /// Failed to start the processing subprocess.
    #[error("Failed to start processing subprocess: {0}")]
    ProcessStart(#[source] io::Error),

    /// Subprocess was spawned without the expected output pipe.
    #[error("Processing subprocess output pipe unavailable")]
    PipeUnavailable,

    /// Upstream request could not be issued or failed before any body.
    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    /// Response could not be assembled.
    #[error("Failed to build response: {reason}")]
    ResponseBuild { reason: String },
}

/// How a descriptor wants its media delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryKind {
    /// Pass one upstream stream through untouched.
    Proxy,
    /// Repackage one interleaved input into the target container.
    Remux,
    /// Combine separate video and audio inputs into one container.
    Merge,
    /// Remux one input, dropping its audio.
    Mute,
    /// Extract/transcode audio from one input.
    Audio,
    /// Transcode one input into an animated GIF.
    Gif,
}

/// Inbound delivery request, produced by the URL resolution layer.
///
/// Opaque beyond the named fields; URL legitimacy is not validated here
/// beyond count/shape checks.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamDescriptor {
    pub service: String,
    #[serde(rename = "type")]
    pub kind: DeliveryKind,
    pub urls: Vec<String>,
    pub filename: String,
    #[serde(default)]
    pub subtitles: Option<String>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
    #[serde(default, rename = "audioFormat")]
    pub audio_format: Option<String>,
    #[serde(default, rename = "audioBitrate")]
    pub audio_bitrate: Option<u32>,
    #[serde(default, rename = "audioCopy")]
    pub audio_copy: bool,
    #[serde(default)]
    pub range: Option<String>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, rename = "isHLS")]
    pub is_hls: bool,
}

/// Direct reverse-proxy of a single upstream stream.
#[derive(Debug, Clone)]
pub struct ProxyPlan {
    pub service: String,
    pub url: String,
    pub filename: String,
    pub range: Option<String>,
    pub header_overrides: Vec<(String, String)>,
}

/// Container remux, with optional merge/mute/subtitle embedding.
#[derive(Debug, Clone)]
pub struct RemuxPlan {
    pub service: String,
    pub urls: Vec<String>,
    pub filename: String,
    pub mute: bool,
    pub subtitles: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub is_hls: bool,
}

/// Audio extraction/transcode of a single input.
#[derive(Debug, Clone)]
pub struct AudioPlan {
    pub service: String,
    pub url: String,
    pub filename: String,
    pub format: String,
    pub bitrate: u32,
    pub copy: bool,
    pub metadata: BTreeMap<String, String>,
    pub is_hls: bool,
}

/// GIF transcode of a single input.
#[derive(Debug, Clone)]
pub struct GifPlan {
    pub service: String,
    pub url: String,
    pub filename: String,
}

/// Closed union over the delivery shapes this gateway supports.
///
/// Validation happens here at the boundary, not deep in argument building:
/// a plan that constructs is a plan whose input counts are right.
#[derive(Debug, Clone)]
pub enum TunnelPlan {
    Proxy(ProxyPlan),
    Remux(RemuxPlan),
    AudioConvert(AudioPlan),
    GifConvert(GifPlan),
}

fn expect_urls(urls: &[String], expected: usize) -> Result<(), TunnelError> {
    if urls.len() != expected {
        return Err(TunnelError::WrongInputCount {
            expected,
            got: urls.len(),
        });
    }
    Ok(())
}

impl TunnelPlan {
    /// Validates a descriptor into a plan.
    ///
    /// # Errors
    ///
    /// - `TunnelError::WrongInputCount` - URL count does not match the kind
    ///   (`merge` needs exactly 2, everything else exactly 1)
    pub fn from_descriptor(descriptor: StreamDescriptor) -> Result<Self, TunnelError> {
        let metadata = descriptor.metadata.unwrap_or_default();

        match descriptor.kind {
            DeliveryKind::Proxy => {
                expect_urls(&descriptor.urls, 1)?;
                Ok(TunnelPlan::Proxy(ProxyPlan {
                    service: descriptor.service,
                    url: descriptor.urls.into_iter().next().expect("checked above"),
                    filename: descriptor.filename,
                    range: descriptor.range,
                    header_overrides: descriptor
                        .headers
                        .unwrap_or_default()
                        .into_iter()
                        .collect(),
                }))
            }
            DeliveryKind::Merge => {
                expect_urls(&descriptor.urls, 2)?;
                Ok(TunnelPlan::Remux(RemuxPlan {
                    service: descriptor.service,
                    urls: descriptor.urls,
                    filename: descriptor.filename,
                    mute: false,
                    subtitles: descriptor.subtitles,
                    metadata,
                    is_hls: descriptor.is_hls,
                }))
            }
            DeliveryKind::Remux | DeliveryKind::Mute => {
                expect_urls(&descriptor.urls, 1)?;
                Ok(TunnelPlan::Remux(RemuxPlan {
                    service: descriptor.service,
                    urls: descriptor.urls,
                    filename: descriptor.filename,
                    mute: descriptor.kind == DeliveryKind::Mute,
                    subtitles: descriptor.subtitles,
                    metadata,
                    is_hls: descriptor.is_hls,
                }))
            }
            DeliveryKind::Audio => {
                expect_urls(&descriptor.urls, 1)?;
                Ok(TunnelPlan::AudioConvert(AudioPlan {
                    service: descriptor.service,
                    url: descriptor.urls.into_iter().next().expect("checked above"),
                    filename: descriptor.filename,
                    format: descriptor
                        .audio_format
                        .unwrap_or_else(|| "mp3".to_string()),
                    bitrate: descriptor.audio_bitrate.unwrap_or(128),
                    copy: descriptor.audio_copy,
                    metadata,
                    is_hls: descriptor.is_hls,
                }))
            }
            DeliveryKind::Gif => {
                expect_urls(&descriptor.urls, 1)?;
                Ok(TunnelPlan::GifConvert(GifPlan {
                    service: descriptor.service,
                    url: descriptor.urls.into_iter().next().expect("checked above"),
                    filename: descriptor.filename,
                }))
            }
        }
    }

    /// The upstream input URLs this plan will consume.
    pub fn urls(&self) -> Vec<String> {
        match self {
            TunnelPlan::Proxy(plan) => vec![plan.url.clone()],
            TunnelPlan::Remux(plan) => plan.urls.clone(),
            TunnelPlan::AudioConvert(plan) => vec![plan.url.clone()],
            TunnelPlan::GifConvert(plan) => vec![plan.url.clone()],
        }
    }

    /// The service the inputs belong to.
    pub fn service(&self) -> &str {
        match self {
            TunnelPlan::Proxy(plan) => &plan.service,
            TunnelPlan::Remux(plan) => &plan.service,
            TunnelPlan::AudioConvert(plan) => &plan.service,
            TunnelPlan::GifConvert(plan) => &plan.service,
        }
    }

    /// The filename presented to the client.
    pub fn filename(&self) -> &str {
        match self {
            TunnelPlan::Proxy(plan) => &plan.filename,
            TunnelPlan::Remux(plan) => &plan.filename,
            TunnelPlan::AudioConvert(plan) => &plan.filename,
            TunnelPlan::GifConvert(plan) => &plan.filename,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(kind: DeliveryKind, urls: &[&str]) -> StreamDescriptor {
        StreamDescriptor {
            service: "twitter".to_string(),
            kind,
            urls: urls.iter().map(|u| u.to_string()).collect(),
            filename: "out.mp4".to_string(),
            subtitles: None,
            metadata: None,
            audio_format: None,
            audio_bitrate: None,
            audio_copy: false,
            range: None,
            headers: None,
            is_hls: false,
        }
    }

    #[test]
    fn test_merge_with_one_url_fails_closed() {
        let result = TunnelPlan::from_descriptor(descriptor(DeliveryKind::Merge, &["a"]));
        assert!(matches!(
            result,
            Err(TunnelError::WrongInputCount {
                expected: 2,
                got: 1
            })
        ));
    }

    #[test]
    fn test_merge_with_two_urls_builds_remux_plan() {
        let plan =
            TunnelPlan::from_descriptor(descriptor(DeliveryKind::Merge, &["v", "a"])).unwrap();
        match plan {
            TunnelPlan::Remux(remux) => {
                assert_eq!(remux.urls, vec!["v", "a"]);
                assert!(!remux.mute);
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    #[test]
    fn test_proxy_requires_single_url() {
        assert!(TunnelPlan::from_descriptor(descriptor(DeliveryKind::Proxy, &["a", "b"])).is_err());
        assert!(TunnelPlan::from_descriptor(descriptor(DeliveryKind::Proxy, &["a"])).is_ok());
    }

    #[test]
    fn test_mute_sets_flag() {
        let plan = TunnelPlan::from_descriptor(descriptor(DeliveryKind::Mute, &["a"])).unwrap();
        assert!(matches!(plan, TunnelPlan::Remux(RemuxPlan { mute: true, .. })));
    }

    #[test]
    fn test_audio_defaults() {
        let plan = TunnelPlan::from_descriptor(descriptor(DeliveryKind::Audio, &["a"])).unwrap();
        match plan {
            TunnelPlan::AudioConvert(audio) => {
                assert_eq!(audio.format, "mp3");
                assert_eq!(audio.bitrate, 128);
                assert!(!audio.copy);
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    #[test]
    fn test_descriptor_json_shape() {
        let descriptor: StreamDescriptor = serde_json::from_str(
            r#"{
                "service": "youtube",
                "type": "merge",
                "urls": ["https://v.example/1", "https://a.example/2"],
                "filename": "video.mp4",
                "audioBitrate": 192,
                "isHLS": true
            }"#,
        )
        .unwrap();
        assert_eq!(descriptor.kind, DeliveryKind::Merge);
        assert_eq!(descriptor.audio_bitrate, Some(192));
        assert!(descriptor.is_hls);
    }
}
