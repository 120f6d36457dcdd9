//! Normalized format metadata and the rules that build it from backend output.
//!
//! Normalization turns the backend's format list into the stable [`Format`]
//! contract, adds synthesized video+audio combinations when the site only offers
//! separate streams, and orders the result for presentation.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::core::error::{AppError, AppResult};
use crate::download::source::{RawFormat, RawVideoInfo};

/// Merge tiers offered when separate video and audio streams exist.
const MERGE_TIERS: &[(u32, &str)] = &[
    (2160, "4K Ultra HD (2160p)"),
    (1440, "QHD (1440p)"),
    (1080, "Full HD (1080p)"),
    (720, "HD (720p)"),
    (480, "SD (480p)"),
];

/// H.264 + AAC only, so the merged mp4 plays in QuickTime as well. Every
/// fallback keeps the H.264 filter; a bare `b` could pick VP9 or AV1.
pub const BEST_AVAILABLE_SELECTOR: &str = "bv*[vcodec^=avc1]+ba[acodec^=mp4a]\
/bv*[vcodec^=avc1]+ba[acodec^=mp4]\
/bv*[vcodec^=avc]+ba[acodec^=mp4a]\
/b[vcodec^=avc1]\
/b[vcodec^=avc]";
pub const BEST_AVAILABLE_LABEL: &str = "Best Available (Merged)";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Format {
    pub id: String,
    pub quality_label: String,
    pub mime_type: String,
    pub filesize_bytes: Option<u64>,
    pub is_audio_only: bool,
    pub is_video_only: bool,
}

impl Format {
    /// A selector that asks the backend for two streams and a merge step.
    pub fn is_two_stream(&self) -> bool {
        is_two_stream(&self.id)
    }

    /// File extension for a download of this format.
    pub fn extension(&self) -> &str {
        if self.is_two_stream() {
            return "mp4";
        }
        self.mime_type.rsplit('/').next().filter(|e| !e.is_empty()).unwrap_or("bin")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub title: String,
    pub thumbnail_url: Option<String>,
    pub duration_seconds: Option<u64>,
    pub formats: Vec<Format>,
}

impl VideoInfo {
    pub fn find_format(&self, id: &str) -> Option<&Format> {
        self.formats.iter().find(|f| f.id == id)
    }
}

/// How a finished download reaches the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeliveryMode {
    /// Bytes piped from the backend's stdout as they are produced
    Direct,
    /// Downloaded into a task directory, merged, then served from disk
    Tracked,
}

impl DeliveryMode {
    /// Selectors that may involve a merge step need a local artifact.
    ///
    /// # Examples
    /// ```
    /// use vidcore::download::formats::DeliveryMode;
    ///
    /// assert_eq!(DeliveryMode::for_format("137+140"), DeliveryMode::Tracked);
    /// assert_eq!(DeliveryMode::for_format("bestvideo[height<=720]"), DeliveryMode::Tracked);
    /// assert_eq!(DeliveryMode::for_format("22"), DeliveryMode::Direct);
    /// ```
    pub fn for_format(format_id: &str) -> Self {
        let merge = format_id.contains('+')
            || format_id == "best"
            || format_id == "bestvideo"
            || format_id.starts_with("best[")
            || format_id.starts_with("bestvideo[");
        if merge {
            DeliveryMode::Tracked
        } else {
            DeliveryMode::Direct
        }
    }
}

pub fn is_two_stream(format_id: &str) -> bool {
    format_id.contains('+')
}

/// Presentation bucket: best available first, then other merges, then the rest.
fn bucket(format: &Format) -> u8 {
    if format.quality_label == BEST_AVAILABLE_LABEL {
        0
    } else if format.is_two_stream() {
        1
    } else {
        2
    }
}

fn has_codec(codec: Option<&str>) -> bool {
    codec.is_some_and(|c| !c.is_empty() && c != "none")
}

fn quality_label(raw: &RawFormat) -> String {
    if let Some(height) = raw.height.filter(|h| *h > 0) {
        return format!("{}p", height);
    }
    if let Some(abr) = raw.abr.filter(|a| a.is_finite() && *a > 0.0) {
        return format!("{}kbps", abr as u64);
    }
    raw.format_note
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

fn mime_type(raw: &RawFormat) -> String {
    let ext = raw.ext.as_deref().filter(|e| !e.is_empty()).unwrap_or("octet-stream");
    if has_codec(raw.vcodec.as_deref()) {
        format!("video/{}", ext)
    } else if has_codec(raw.acodec.as_deref()) {
        format!("audio/{}", ext)
    } else if matches!(ext, "mp4" | "m4v" | "mov" | "webm") {
        format!("video/{}", ext)
    } else {
        format!("application/{}", ext)
    }
}

fn filesize(raw: &RawFormat) -> Option<u64> {
    raw.filesize
        .or(raw.filesize_approx)
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(|s| s as u64)
}

/// Normalized entry plus the height used for ordering.
struct Candidate {
    format: Format,
    height: u32,
}

fn normalize_one(raw: &RawFormat) -> Option<Candidate> {
    let id = raw.format_id.as_deref().map(str::trim).filter(|id| !id.is_empty() && *id != "unknown")?;
    let video = has_codec(raw.vcodec.as_deref());
    let audio = has_codec(raw.acodec.as_deref());

    Some(Candidate {
        format: Format {
            id: id.to_string(),
            quality_label: quality_label(raw),
            mime_type: mime_type(raw),
            filesize_bytes: filesize(raw),
            is_audio_only: audio && !video,
            is_video_only: video && !audio,
        },
        height: raw.height.unwrap_or(0),
    })
}

fn merged(id: String, label: String, height: u32) -> Candidate {
    Candidate {
        format: Format {
            id,
            quality_label: label,
            mime_type: "video/mp4".to_string(),
            filesize_bytes: None,
            is_audio_only: false,
            is_video_only: false,
        },
        height,
    }
}

/// Same codec rules as [`BEST_AVAILABLE_SELECTOR`], capped at `height`.
fn tier_selector(height: u32) -> String {
    format!(
        "bv*[height<={h}][vcodec^=avc1]+ba[acodec^=mp4a]\
/bv*[height<={h}][vcodec^=avc1]+ba[acodec^=mp4]\
/bv*[height<={h}][vcodec^=avc]+ba[acodec^=mp4a]\
/b[height<={h}][vcodec^=avc1]\
/b[height<={h}][vcodec^=avc]",
        h = height
    )
}

/// Synthesized combinations, only when separate video and audio streams exist.
fn merged_candidates(streams: &[Candidate]) -> Vec<Candidate> {
    let has_audio_only = streams.iter().any(|c| c.format.is_audio_only);
    let video_heights: Vec<u32> = streams
        .iter()
        .filter(|c| c.format.is_video_only)
        .map(|c| c.height)
        .collect();
    if !has_audio_only || video_heights.is_empty() {
        return Vec::new();
    }

    let top = video_heights.iter().copied().max().unwrap_or(0);
    let mut out = vec![merged(BEST_AVAILABLE_SELECTOR.to_string(), BEST_AVAILABLE_LABEL.to_string(), top)];
    out.extend(
        MERGE_TIERS
            .iter()
            .filter(|(height, _)| video_heights.contains(height))
            .map(|(height, label)| merged(tier_selector(*height), format!("{} (Merged)", label), *height)),
    );
    out
}

/// Build the public [`VideoInfo`] from raw backend metadata.
///
/// Fails with `FormatNotAvailable` when nothing downloadable remains.
pub fn normalize_video_info(raw: RawVideoInfo) -> AppResult<VideoInfo> {
    if raw.is_live == Some(true) {
        return Err(AppError::FormatNotAvailable("live streams cannot be downloaded".to_string()));
    }

    let raw_formats: Vec<&RawFormat> = if raw.formats.is_empty() {
        vec![&raw.top_level]
    } else {
        raw.formats.iter().collect()
    };

    let streams: Vec<Candidate> = raw_formats
        .into_iter()
        .filter_map(normalize_one)
        .unique_by(|c| c.format.id.clone())
        .collect();

    if streams.is_empty() {
        return Err(AppError::FormatNotAvailable("no downloadable formats".to_string()));
    }

    let mut all = merged_candidates(&streams);
    all.extend(streams);
    // Stable: ties keep backend order
    all.sort_by_key(|c| (bucket(&c.format), c.format.is_audio_only, std::cmp::Reverse(c.height)));

    let formats = all
        .into_iter()
        .map(|c| c.format)
        .unique_by(|f| f.id.clone())
        .collect();

    Ok(VideoInfo {
        title: raw
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Unknown Title".to_string()),
        thumbnail_url: raw.thumbnail.filter(|t| !t.is_empty()),
        duration_seconds: raw.duration.filter(|d| d.is_finite() && *d >= 0.0).map(|d| d as u64),
        formats,
    })
}
