//! Extraction backend abstraction.
//!
//! The engine needs two things from a backend: metadata for a URL without
//! downloading, and a command line that downloads one format selector either to
//! stdout or into a directory while printing line-oriented progress. Anything
//! that can provide both (a CLI tool, a wrapper script, a test double) plugs in
//! through [`ExtractionBackend`].
//!
//! Built-in backends:
//! - `YtDlpBackend` — the yt-dlp CLI

pub mod ytdlp;

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::process::Command;
use url::Url;

use crate::core::error::AppError;

pub use ytdlp::YtDlpBackend;

/// Where the downloaded bytes should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Write the media to stdout (`-o -`); progress goes to stderr
    Stdout,
    /// Write the final file into this directory, named after the task
    Directory { dir: PathBuf, stem: String },
}

/// Parameters for one download invocation.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: Url,
    /// Backend selector, e.g. `"22"` or `"137+140"`
    pub format_id: String,
    pub target: OutputTarget,
}

/// Backend metadata as reported, before normalization.
///
/// Field names follow yt-dlp's `--dump-json` output. Extractors that expose a
/// single stream put its fields at the top level instead of in `formats`; those
/// land in `top_level`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawVideoInfo {
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub duration: Option<f64>,
    #[serde(default)]
    pub formats: Vec<RawFormat>,
    pub is_live: Option<bool>,
    #[serde(flatten)]
    pub top_level: RawFormat,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawFormat {
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub height: Option<u32>,
    pub abr: Option<f64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub format_note: Option<String>,
    pub filesize: Option<f64>,
    pub filesize_approx: Option<f64>,
}

#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    /// Human-readable name of this backend (e.g., "yt-dlp")
    fn name(&self) -> &str;

    /// Fetch metadata and the format list without downloading anything.
    async fn extract_metadata(&self, url: &Url) -> Result<RawVideoInfo, AppError>;

    /// Build (but do not spawn) the download command for `request`.
    ///
    /// The command must print one progress record per line.
    fn download_command(&self, request: &DownloadRequest) -> Command;
}
