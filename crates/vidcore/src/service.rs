//! The engine's public face.
//!
//! [`DownloadService`] owns every piece of shared state (format cache, task
//! registry) and wires validation, resolution, supervision and delivery
//! together. Hosts create one and share it behind an `Arc`.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::core::config::EngineConfig;
use crate::core::error::{AppError, AppResult};
use crate::core::logging::sanitize_url_for_logging;
use crate::core::validation::{validate_format_id, HostResolver, NormalizedUrl, SystemResolver, UrlValidator};
use crate::download::delivery::{download_file_name, DirectDownload, TrackedFile};
use crate::download::formats::{DeliveryMode, Format, VideoInfo};
use crate::download::registry::{TaskRegistry, TaskSubscription};
use crate::download::resolver::FormatResolver;
use crate::download::source::{DownloadRequest, ExtractionBackend, OutputTarget, YtDlpBackend};
use crate::download::supervisor::Supervisor;
use crate::download::task::{TaskSnapshot, TaskStatus};
use crate::storage::cache::{CacheStats, FormatCache};

/// Bytes for a one-shot download, however they were produced.
#[derive(Debug)]
pub enum Delivery {
    Direct(DirectDownload),
    Tracked(TrackedFile),
}

pub struct DownloadService {
    config: EngineConfig,
    validator: UrlValidator,
    resolver: FormatResolver,
    registry: Arc<TaskRegistry>,
    supervisor: Supervisor,
}

impl DownloadService {
    /// Service backed by the yt-dlp CLI.
    pub fn new(config: EngineConfig) -> Self {
        let backend = Arc::new(YtDlpBackend::new(config.ytdlp.clone(), config.tasks.resolve_timeout));
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: EngineConfig, backend: Arc<dyn ExtractionBackend>) -> Self {
        Self::with_parts(config, backend, Arc::new(SystemResolver))
    }

    /// Full control over the backend and DNS resolution.
    pub fn with_parts(
        config: EngineConfig,
        backend: Arc<dyn ExtractionBackend>,
        host_resolver: Arc<dyn HostResolver>,
    ) -> Self {
        log::info!(
            "Download service using backend '{}', work dir {}",
            backend.name(),
            config.tasks.work_dir.display()
        );
        Self {
            validator: UrlValidator::with_resolver(&config.validation, host_resolver),
            resolver: FormatResolver::new(
                Arc::clone(&backend),
                FormatCache::new(&config.cache),
                config.tasks.resolve_timeout,
            ),
            registry: Arc::new(TaskRegistry::new(&config.tasks)),
            supervisor: Supervisor::new(backend, config.tasks.clone(), config.delivery.clone()),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Normalized formats for `url`, served from cache when fresh.
    #[instrument(skip_all, fields(url = %sanitize_url_for_logging(url)))]
    pub async fn resolve_formats(&self, url: &str) -> AppResult<Arc<VideoInfo>> {
        let url = self.validator.validate(url).await?;
        self.resolver.resolve(&url).await
    }

    /// Start a tracked download and return its task id.
    #[instrument(skip_all, fields(url = %sanitize_url_for_logging(url), format_id = %format_id))]
    pub async fn start_download(&self, url: &str, format_id: &str) -> AppResult<String> {
        let (url, info, format) = self.prepare(url, format_id).await?;

        let handle = self.registry.create(
            url.as_str(),
            &format.id,
            &info.title,
            Some(self.config.tasks.work_dir.as_path()),
        );
        let work_dir = handle
            .work_dir()
            .ok_or_else(|| AppError::Internal("task created without a work dir".to_string()))?;
        let request = DownloadRequest {
            url: url.url().clone(),
            format_id: format.id.clone(),
            target: OutputTarget::Directory {
                dir: work_dir,
                stem: handle.id().to_string(),
            },
        };

        let task_id = handle.id().to_string();
        log::info!("Task {} created for format {} ({})", task_id, format.id, format.quality_label);
        self.supervisor.spawn_tracked(handle, request);
        Ok(task_id)
    }

    pub fn task(&self, id: &str) -> AppResult<TaskSnapshot> {
        self.registry.get(id)
    }

    /// Current snapshot followed by every later change until the task ends.
    pub fn subscribe(&self, id: &str) -> AppResult<TaskSubscription> {
        self.registry.subscribe(id)
    }

    pub async fn cancel(&self, id: &str) -> AppResult<TaskSnapshot> {
        self.registry.cancel(id).await
    }

    /// Drop a finished task and its files before retention runs out.
    pub async fn acknowledge(&self, id: &str) -> AppResult<bool> {
        self.registry.acknowledge(id).await
    }

    /// Open the artifact of a completed task. Can be called repeatedly.
    pub async fn open_result(&self, id: &str) -> AppResult<TrackedFile> {
        let artifact = self.registry.artifact(id)?;
        TrackedFile::open(&artifact, self.config.delivery.stream_chunk_size).await
    }

    /// Pipe a single-stream format straight from the backend.
    ///
    /// Dropping the returned stream kills the backend process.
    #[instrument(skip_all, fields(url = %sanitize_url_for_logging(url), format_id = %format_id))]
    pub async fn stream_direct(&self, url: &str, format_id: &str) -> AppResult<DirectDownload> {
        let (url, info, format) = self.prepare(url, format_id).await?;
        if DeliveryMode::for_format(&format.id) == DeliveryMode::Tracked {
            return Err(AppError::FormatNotAvailable(format!(
                "{} needs a merge step and cannot be streamed directly",
                format.id
            )));
        }

        let request = DownloadRequest {
            url: url.url().clone(),
            format_id: format.id.clone(),
            target: OutputTarget::Stdout,
        };
        let process = self.supervisor.start_direct(&request).await?;
        log::info!("Streaming format {} directly (pid {})", format.id, process.pid);

        Ok(DirectDownload::new(
            process,
            download_file_name(&info.title, format.extension()),
            format.mime_type.clone(),
            self.config.delivery.stream_chunk_size,
        ))
    }

    /// One-shot download in whichever mode the format needs.
    ///
    /// Merge selectors run as a tracked task; this waits for it and then opens
    /// the result. A failed task surfaces as `ExtractionFailed` with its cause.
    pub async fn fetch(&self, url: &str, format_id: &str) -> AppResult<Delivery> {
        if DeliveryMode::for_format(format_id) == DeliveryMode::Direct {
            return self.stream_direct(url, format_id).await.map(Delivery::Direct);
        }

        let task_id = self.start_download(url, format_id).await?;
        let mut subscription = self.subscribe(&task_id)?;
        let mut last = None;
        while let Some(snapshot) = subscription.next().await {
            last = Some(snapshot);
        }

        match last {
            Some(snapshot) if snapshot.status == TaskStatus::Completed => {
                self.open_result(&task_id).await.map(Delivery::Tracked)
            }
            Some(snapshot) => Err(AppError::ExtractionFailed(
                snapshot.error.unwrap_or_else(|| snapshot.status.to_string()),
            )),
            None => Err(AppError::Internal(format!("task {} ended without a final state", task_id))),
        }
    }

    pub fn delivery_mode(&self, format_id: &str) -> DeliveryMode {
        DeliveryMode::for_format(format_id)
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.registry.spawn_sweeper(self.config.tasks.sweep_interval)
    }

    /// Cancel every live task, kill direct-mode processes and stop background
    /// work. Does not wait; see [`DownloadService::shutdown`].
    pub fn stop(&self) {
        log::info!(
            "Stopping download service, {} active tasks, {} workers",
            self.registry.active_count(),
            self.supervisor.worker_count()
        );
        self.registry.shutdown();
        self.supervisor.stop();
    }

    /// [`stop`](DownloadService::stop), then wait up to `tasks.cancel_wait` for
    /// every download process to be reaped and its work dir removed.
    ///
    /// Returns false if some workers were still running when the wait ran out.
    pub async fn shutdown(&self) -> bool {
        self.stop();
        self.supervisor.shutdown(self.config.tasks.cancel_wait).await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.resolver.cache_stats().await
    }

    pub fn task_count(&self) -> usize {
        self.registry.len()
    }

    pub fn active_task_count(&self) -> usize {
        self.registry.active_count()
    }

    /// Validate inputs, resolve metadata and pick the requested format.
    async fn prepare(&self, url: &str, format_id: &str) -> AppResult<(NormalizedUrl, Arc<VideoInfo>, Format)> {
        validate_format_id(format_id)?;
        let url = self.validator.validate(url).await?;
        let info = self.resolver.resolve(&url).await?;
        let format = info
            .find_format(format_id)
            .cloned()
            .ok_or_else(|| AppError::FormatNotAvailable(format!("{} is not offered for this video", format_id)))?;
        Ok((url, info, format))
    }
}

impl Drop for DownloadService {
    fn drop(&mut self) {
        self.registry.shutdown();
        self.supervisor.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::source::{RawFormat, RawVideoInfo};
    use async_trait::async_trait;
    use std::net::IpAddr;
    use tokio::process::Command;
    use url::Url;

    struct PublicResolver;

    #[async_trait]
    impl HostResolver for PublicResolver {
        async fn resolve(&self, _host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
            Ok(vec!["93.184.216.34".parse().unwrap()])
        }
    }

    struct OneFormat;

    #[async_trait]
    impl ExtractionBackend for OneFormat {
        fn name(&self) -> &str {
            "one-format"
        }

        async fn extract_metadata(&self, _url: &Url) -> Result<RawVideoInfo, AppError> {
            Ok(RawVideoInfo {
                title: Some("Clip".to_string()),
                formats: vec![RawFormat {
                    format_id: Some("18".to_string()),
                    ext: Some("mp4".to_string()),
                    height: Some(360),
                    vcodec: Some("avc1".to_string()),
                    acodec: Some("mp4a".to_string()),
                    ..RawFormat::default()
                }],
                ..RawVideoInfo::default()
            })
        }

        fn download_command(&self, _request: &DownloadRequest) -> Command {
            Command::new("true")
        }
    }

    fn service() -> DownloadService {
        DownloadService::with_parts(EngineConfig::default(), Arc::new(OneFormat), Arc::new(PublicResolver))
    }

    #[tokio::test]
    async fn test_unknown_format_is_rejected() {
        let err = service().start_download("https://v.example.com/w?v=1", "999").await.unwrap_err();
        assert!(matches!(err, AppError::FormatNotAvailable(_)));
    }

    #[tokio::test]
    async fn test_injection_format_is_rejected_before_resolving() {
        let err = service()
            .start_download("https://v.example.com/w?v=1", "18; rm -rf /")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::FormatNotAvailable(_)));
    }

    #[tokio::test]
    async fn test_private_url_is_rejected() {
        let err = service().resolve_formats("http://127.0.0.1/video").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let svc = service();
        assert!(matches!(svc.task("nope"), Err(AppError::TaskNotFound(_))));
        assert!(matches!(svc.open_result("nope").await, Err(AppError::TaskNotFound(_))));
    }
}
