//! Shared helpers for vidcore integration tests
//!
//! `ScriptBackend` stands in for yt-dlp: metadata comes from a fixed
//! `RawVideoInfo`, downloads run small `sh` scripts that print the same line
//! protocol and write files the way the real tool does.

#![allow(dead_code)]

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use url::Url;
use vidcore::core::validation::HostResolver;
use vidcore::download::source::{DownloadRequest, ExtractionBackend, OutputTarget, RawFormat, RawVideoInfo};
use vidcore::{AppError, DownloadService, EngineConfig, TaskSnapshot};

pub const VIDEO_URL: &str = "https://video.example.com/watch?v=abc123";

/// Resolves every host to a fixed list of addresses.
pub struct FixedResolver(pub Vec<IpAddr>);

impl FixedResolver {
    pub fn public() -> Self {
        Self(vec!["93.184.216.34".parse().unwrap()])
    }
}

#[async_trait]
impl HostResolver for FixedResolver {
    async fn resolve(&self, _host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
        Ok(self.0.clone())
    }
}

pub struct ScriptBackend {
    pub info: RawVideoInfo,
    /// Run as `sh -c <script> sh <dir> <stem>` for tracked downloads
    pub tracked_script: String,
    /// Run as `sh -c <script>` for direct downloads
    pub direct_script: String,
    pub metadata_calls: AtomicUsize,
}

impl ScriptBackend {
    pub fn new(tracked_script: &str, direct_script: &str) -> Self {
        Self {
            info: sample_info(),
            tracked_script: tracked_script.to_string(),
            direct_script: direct_script.to_string(),
            metadata_calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractionBackend for ScriptBackend {
    fn name(&self) -> &str {
        "script"
    }

    async fn extract_metadata(&self, _url: &Url) -> Result<RawVideoInfo, AppError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.info.clone())
    }

    fn download_command(&self, request: &DownloadRequest) -> Command {
        let mut cmd = Command::new("sh");
        match &request.target {
            OutputTarget::Directory { dir, stem } => {
                cmd.arg("-c").arg(&self.tracked_script).arg("sh").arg(dir).arg(stem);
            }
            OutputTarget::Stdout => {
                cmd.arg("-c").arg(&self.direct_script);
            }
        }
        cmd
    }
}

fn raw(id: &str, ext: &str, height: Option<u32>, vcodec: &str, acodec: &str) -> RawFormat {
    RawFormat {
        format_id: Some(id.to_string()),
        ext: Some(ext.to_string()),
        height,
        vcodec: Some(vcodec.to_string()),
        acodec: Some(acodec.to_string()),
        ..RawFormat::default()
    }
}

/// One progressive stream plus separate 1080p video and audio.
pub fn sample_info() -> RawVideoInfo {
    RawVideoInfo {
        title: Some("Clip".to_string()),
        duration: Some(42.0),
        formats: vec![
            raw("18", "mp4", Some(360), "avc1.42001E", "mp4a.40.2"),
            raw("137", "mp4", Some(1080), "avc1.640028", "none"),
            raw("140", "m4a", None, "none", "mp4a.40.2"),
        ],
        ..RawVideoInfo::default()
    }
}

pub fn test_config(work_dir: &std::path::Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.tasks.work_dir = work_dir.to_path_buf();
    config.tasks.kill_grace = Duration::from_millis(500);
    config.tasks.cancel_wait = Duration::from_secs(5);
    config.delivery.stream_chunk_size = 64 * 1024;
    config
}

pub fn service(config: EngineConfig, backend: Arc<ScriptBackend>) -> DownloadService {
    DownloadService::with_parts(config, backend, Arc::new(FixedResolver::public()))
}

/// Every snapshot a subscriber sees until the task ends.
pub async fn collect_until_terminal(svc: &DownloadService, task_id: &str) -> Vec<TaskSnapshot> {
    let mut subscription = svc.subscribe(task_id).unwrap();
    let mut seen = Vec::new();
    let collect = async {
        while let Some(snapshot) = subscription.next().await {
            seen.push(snapshot);
        }
    };
    tokio::time::timeout(Duration::from_secs(15), collect)
        .await
        .expect("task did not finish in time");
    seen
}
