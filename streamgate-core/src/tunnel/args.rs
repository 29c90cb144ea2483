//! Argument builders for the media-processing subprocess.
//!
//! Pure functions turning a validated plan into the ffmpeg command line the
//! stream pipeline spawns. Video is always stream-copied; audio is copied
//! unless muted or listed in the per-service re-encode exception table;
//! every job writes its output to the stdout pipe.

use tracing::debug;

use super::{AudioPlan, GifPlan, RemuxPlan, TunnelError};

/// A built subprocess job: the argument list plus the size-correction
/// factor used by the length estimator.
#[derive(Debug, Clone)]
pub struct FfmpegJob {
    pub args: Vec<String>,
    pub estimate_multiplier: f64,
}

/// Remuxed output grows slightly from container overhead.
const REMUX_MULTIPLIER: f64 = 1.1;

/// Safety factor on top of the bitrate ratio for audio transcodes.
const AUDIO_SAFETY_MULTIPLIER: f64 = 1.1;

/// GIF output dwarfs the source; be very conservative.
const GIF_MULTIPLIER: f64 = 60.0;

/// Reference bitrate the audio estimate ratio is computed against.
const REFERENCE_AUDIO_BITRATE: u32 = 128;

/// Services whose streams need audio re-encoded for streaming delivery of
/// the given container, with the codec to use.
const AUDIO_REENCODE: &[(&str, &str, &str)] = &[
    ("vimeo", "mp4", "aac"),
    ("vimeo", "webm", "libopus"),
    ("rutube", "mp4", "aac"),
];

/// Metadata tags that may be forwarded into the output container.
const ALLOWED_METADATA_TAGS: &[&str] = &[
    "title",
    "artist",
    "album",
    "genre",
    "composer",
    "copyright",
    "album_artist",
    "track",
    "date",
];

/// Fragmented-MP4 flags enabling progressive playback of piped output;
/// plain faststart needs a seekable file and cannot work on a pipe.
const MP4_STREAM_FLAGS: &str = "frag_keyframe+empty_moov+default_base_moof";

/// Global flags every job starts with: overwrite (a no-op on pipes) and
/// quiet output, keeping stderr to genuine errors.
const GLOBAL_ARGS: &[&str] = &["-y", "-loglevel", "error"];

fn push(args: &mut Vec<String>, values: &[&str]) {
    args.extend(values.iter().map(|v| v.to_string()));
}

fn container_extension(filename: &str) -> Result<String, TunnelError> {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .ok_or_else(|| TunnelError::UnsupportedFormat {
            format: filename.to_string(),
        })
}

fn is_mp4_family(extension: &str) -> bool {
    matches!(extension, "mp4" | "m4a" | "mov")
}

/// Maps a container extension to the ffmpeg muxer name.
fn muxer_for(extension: &str) -> &str {
    match extension {
        "mkv" => "matroska",
        "m4a" => "mp4",
        other => other,
    }
}

fn push_input(args: &mut Vec<String>, url: &str, is_hls: bool, header_block: Option<&str>) {
    if is_hls {
        if let Some(block) = header_block {
            push(args, &["-headers", block]);
        }
    }
    push(args, &["-i", url]);
}

/// Builds `-metadata` arguments from an allow-listed tag map.
///
/// `sublanguage` maps to a subtitle-stream-scoped language tag; any tag
/// outside the allow-list fails the request. Control characters are
/// stripped from values before they reach the command line.
fn metadata_args(
    metadata: &std::collections::BTreeMap<String, String>,
) -> Result<Vec<String>, TunnelError> {
    let mut args = Vec::new();
    for (tag, value) in metadata {
        let value: String = value.chars().filter(|c| !c.is_control()).collect();
        if tag == "sublanguage" {
            args.push("-metadata:s:s:0".to_string());
            args.push(format!("language={value}"));
        } else if ALLOWED_METADATA_TAGS.contains(&tag.as_str()) {
            args.push("-metadata".to_string());
            args.push(format!("{tag}={value}"));
        } else {
            return Err(TunnelError::UnsupportedMetadataTag { tag: tag.clone() });
        }
    }
    Ok(args)
}

/// Builds the remux/merge/mute job.
///
/// Input 0 carries video; a second input carries audio; a subtitle URL
/// becomes one further input mapped as a subtitle stream with a
/// container-appropriate codec.
///
/// # Errors
///
/// - `TunnelError::UnsupportedFormat` - Filename has no container extension
/// - `TunnelError::UnsupportedMetadataTag` - Tag outside the allow-list
pub fn build_remux_args(
    plan: &RemuxPlan,
    input_header_block: Option<&str>,
) -> Result<FfmpegJob, TunnelError> {
    let extension = container_extension(&plan.filename)?;
    let mut args = Vec::new();
    push(&mut args, GLOBAL_ARGS);

    for url in &plan.urls {
        push_input(&mut args, url, plan.is_hls, input_header_block);
    }
    if let Some(subtitles) = &plan.subtitles {
        push(&mut args, &["-i", subtitles]);
    }

    if plan.urls.len() == 2 {
        push(&mut args, &["-map", "0:v", "-map", "1:a"]);
    } else {
        push(&mut args, &["-map", "0"]);
    }
    if plan.subtitles.is_some() {
        let subtitle_input = plan.urls.len().to_string();
        push(&mut args, &["-map", &format!("{subtitle_input}:s")]);
    }

    push(&mut args, &["-c:v", "copy"]);

    if plan.mute {
        push(&mut args, &["-an"]);
    } else {
        let reencode = AUDIO_REENCODE
            .iter()
            .find(|(service, ext, _)| *service == plan.service && *ext == extension)
            .map(|(_, _, codec)| *codec);
        match reencode {
            Some(codec) => {
                debug!(service = %plan.service, codec, "re-encoding audio for streaming");
                push(&mut args, &["-c:a", codec]);
            }
            None => push(&mut args, &["-c:a", "copy"]),
        }
    }

    if plan.subtitles.is_some() {
        let codec = if is_mp4_family(&extension) {
            "mov_text"
        } else {
            "webvtt"
        };
        push(&mut args, &["-c:s", codec]);
    }

    if is_mp4_family(&extension) {
        push(&mut args, &["-movflags", MP4_STREAM_FLAGS]);
    }

    args.extend(metadata_args(&plan.metadata)?);
    push(&mut args, &["-f", muxer_for(&extension), "pipe:1"]);

    Ok(FfmpegJob {
        args,
        estimate_multiplier: REMUX_MULTIPLIER,
    })
}

/// Builds the audio extraction/transcode job.
///
/// # Errors
///
/// - `TunnelError::UnsupportedMetadataTag` - Tag outside the allow-list
pub fn build_audio_args(
    plan: &AudioPlan,
    input_header_block: Option<&str>,
) -> Result<FfmpegJob, TunnelError> {
    let mut args = Vec::new();
    push(&mut args, GLOBAL_ARGS);
    push_input(&mut args, &plan.url, plan.is_hls, input_header_block);
    push(&mut args, &["-vn"]);

    let multiplier;
    if plan.copy {
        push(&mut args, &["-c:a", "copy"]);
        multiplier = AUDIO_SAFETY_MULTIPLIER;
    } else {
        let codec = match plan.format.as_str() {
            "mp3" => "libmp3lame",
            "opus" => "libopus",
            "ogg" => "libvorbis",
            "wav" => "pcm_s16le",
            _ => "aac",
        };
        push(&mut args, &["-c:a", codec]);
        push(&mut args, &["-b:a", &format!("{}k", plan.bitrate)]);

        // Very low MP3 bitrates are only encodable at a reduced rate.
        if codec == "libmp3lame" && plan.bitrate <= 8 {
            push(&mut args, &["-ar", "8000"]);
        }
        if codec == "libopus" {
            push(&mut args, &["-vbr", "off"]);
        }

        multiplier = f64::from(plan.bitrate) / f64::from(REFERENCE_AUDIO_BITRATE)
            * AUDIO_SAFETY_MULTIPLIER;
    }

    args.extend(metadata_args(&plan.metadata)?);

    let extension = container_extension(&plan.filename).unwrap_or_else(|_| plan.format.clone());
    if is_mp4_family(&extension) {
        push(&mut args, &["-movflags", MP4_STREAM_FLAGS]);
    }
    push(&mut args, &["-f", muxer_for(&extension), "pipe:1"]);

    Ok(FfmpegJob {
        args,
        estimate_multiplier: multiplier,
    })
}

/// Builds the GIF transcode job with the two-pass palette filter chain.
pub fn build_gif_args(plan: &GifPlan) -> Result<FfmpegJob, TunnelError> {
    let mut args = Vec::new();
    push(&mut args, GLOBAL_ARGS);
    push(&mut args, &["-i", &plan.url]);
    push(
        &mut args,
        &[
            "-vf",
            "scale=-1:-1:flags=lanczos,split[s0][s1];[s0]palettegen[p];[s1][p]paletteuse",
            "-loop",
            "0",
            "-f",
            "gif",
            "pipe:1",
        ],
    );

    Ok(FfmpegJob {
        args,
        estimate_multiplier: GIF_MULTIPLIER,
    })
}
