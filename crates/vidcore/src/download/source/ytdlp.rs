//! yt-dlp CLI backend.

use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use url::Url;

use crate::core::config::YtDlpConfig;
use crate::core::error::AppError;
use crate::core::logging::sanitize_url_for_logging;
use crate::core::process::run_with_timeout;
use crate::download::source::{DownloadRequest, ExtractionBackend, OutputTarget, RawVideoInfo};
use crate::download::ytdlp_errors::{analyze_ytdlp_error, into_app_error};

pub struct YtDlpBackend {
    config: YtDlpConfig,
    metadata_timeout: Duration,
}

impl YtDlpBackend {
    pub fn new(config: YtDlpConfig, metadata_timeout: Duration) -> Self {
        Self {
            config,
            metadata_timeout,
        }
    }

    /// Network options shared by metadata and download invocations.
    fn push_network_args(&self, args: &mut Vec<String>) {
        args.push("--socket-timeout".to_string());
        args.push(self.config.socket_timeout.to_string());
        if let Some(ua) = &self.config.user_agent {
            args.push("--user-agent".to_string());
            args.push(ua.clone());
        }
        if let Some(browser) = &self.config.cookies_from_browser {
            args.push("--cookies-from-browser".to_string());
            args.push(browser.clone());
        }
        if let Some(proxy) = &self.config.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
    }

    fn build_metadata_args(&self, url: &Url) -> Vec<String> {
        let mut args: Vec<String> = ["-J", "--no-playlist", "--no-warnings", "--skip-download"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        self.push_network_args(&mut args);
        args.push("--".to_string());
        args.push(url.to_string());
        args
    }

    fn build_download_args(&self, request: &DownloadRequest) -> Vec<String> {
        let c = &self.config;
        let mut args = vec![
            "-f".to_string(),
            request.format_id.clone(),
            "--newline".to_string(),
            "--progress".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--concurrent-fragments".to_string(),
            c.concurrent_fragments.to_string(),
            "--throttled-rate".to_string(),
            c.throttled_rate.clone(),
            "--buffer-size".to_string(),
            c.buffer_size.clone(),
            "--retries".to_string(),
            c.retries.to_string(),
            "--fragment-retries".to_string(),
            c.fragment_retries.to_string(),
            "--extractor-retries".to_string(),
            c.extractor_retries.to_string(),
            "--file-access-retries".to_string(),
            c.file_access_retries.to_string(),
        ];
        self.push_network_args(&mut args);

        if let Some(secs) = c.sleep_requests {
            args.push("--sleep-requests".to_string());
            args.push(secs.to_string());
        }
        if let Some(size) = &c.http_chunk_size {
            args.push("--http-chunk-size".to_string());
            args.push(size.clone());
        }
        if let Some(categories) = &c.sponsorblock_remove {
            args.push("--sponsorblock-remove".to_string());
            args.push(categories.clone());
        }

        match &request.target {
            OutputTarget::Stdout => {
                args.push("-o".to_string());
                args.push("-".to_string());
            }
            OutputTarget::Directory { dir, stem } => {
                args.push("-o".to_string());
                args.push(dir.join(format!("{}.%(ext)s", stem)).to_string_lossy().into_owned());
                args.push("--merge-output-format".to_string());
                args.push(c.merge_output_format.clone());
                args.push("--no-part".to_string());
            }
        }

        args.push("--".to_string());
        args.push(request.url.to_string());
        args
    }
}

#[async_trait]
impl ExtractionBackend for YtDlpBackend {
    fn name(&self) -> &str {
        "yt-dlp"
    }

    async fn extract_metadata(&self, url: &Url) -> Result<RawVideoInfo, AppError> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(self.build_metadata_args(url));

        log::debug!("yt-dlp metadata request for {}", sanitize_url_for_logging(url.as_str()));
        let output = run_with_timeout(&mut cmd, self.metadata_timeout)
            .await
            .map_err(|e| match e {
                AppError::Io(io) => AppError::ExtractionFailed(format!("failed to run {}: {}", self.config.binary, io)),
                other => other,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let error_type = analyze_ytdlp_error(&stderr);
            log::warn!(
                "yt-dlp metadata failed ({}) for {}: exit {:?}",
                error_type,
                sanitize_url_for_logging(url.as_str()),
                output.status.code()
            );
            return Err(into_app_error(error_type, &stderr));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| AppError::ExtractionFailed(format!("unparseable yt-dlp output: {}", e)))
    }

    fn download_command(&self, request: &DownloadRequest) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(self.build_download_args(request));
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn backend() -> YtDlpBackend {
        YtDlpBackend::new(YtDlpConfig::default(), Duration::from_secs(5))
    }

    fn request(target: OutputTarget) -> DownloadRequest {
        DownloadRequest {
            url: Url::parse("https://video.example.com/watch?v=abc").unwrap(),
            format_id: "137+140".to_string(),
            target,
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter().position(|a| a == flag).map(|i| args[i + 1].as_str())
    }

    #[test]
    fn test_tracked_args_write_into_task_dir() {
        let args = backend().build_download_args(&request(OutputTarget::Directory {
            dir: PathBuf::from("/tmp/work/t1"),
            stem: "t1".to_string(),
        }));
        assert_eq!(value_after(&args, "-f"), Some("137+140"));
        assert_eq!(value_after(&args, "-o"), Some("/tmp/work/t1/t1.%(ext)s"));
        assert_eq!(value_after(&args, "--merge-output-format"), Some("mp4"));
        assert_eq!(value_after(&args, "--throttled-rate"), Some("100K"));
        assert!(args.contains(&"--newline".to_string()));
        assert!(args.contains(&"--no-part".to_string()));
        // URL always comes after the option terminator
        assert_eq!(&args[args.len() - 2..], ["--", "https://video.example.com/watch?v=abc"]);
    }

    #[test]
    fn test_direct_args_stream_to_stdout() {
        let args = backend().build_download_args(&request(OutputTarget::Stdout));
        assert_eq!(value_after(&args, "-o"), Some("-"));
        assert!(!args.contains(&"--merge-output-format".to_string()));
    }

    #[test]
    fn test_optional_args() {
        let config = YtDlpConfig {
            proxy: Some("socks5://127.0.0.1:1080".to_string()),
            sleep_requests: Some(1.5),
            sponsorblock_remove: Some("sponsor".to_string()),
            ..YtDlpConfig::default()
        };
        let backend = YtDlpBackend::new(config, Duration::from_secs(5));
        let args = backend.build_download_args(&request(OutputTarget::Stdout));
        assert_eq!(value_after(&args, "--proxy"), Some("socks5://127.0.0.1:1080"));
        assert_eq!(value_after(&args, "--sleep-requests"), Some("1.5"));
        assert_eq!(value_after(&args, "--sponsorblock-remove"), Some("sponsor"));
        assert_eq!(value_after(&args, "--http-chunk-size"), None);

        let meta = backend.build_metadata_args(&Url::parse("https://video.example.com/v").unwrap());
        assert_eq!(meta[0], "-J");
        assert_eq!(value_after(&meta, "--proxy"), Some("socks5://127.0.0.1:1080"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_extraction_failure() {
        let config = YtDlpConfig {
            binary: "/nonexistent/yt-dlp-binary".to_string(),
            ..YtDlpConfig::default()
        };
        let backend = YtDlpBackend::new(config, Duration::from_secs(5));
        let err = backend
            .extract_metadata(&Url::parse("https://video.example.com/v").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ExtractionFailed(_)));
    }
}
