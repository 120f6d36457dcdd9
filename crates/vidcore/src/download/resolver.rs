//! URL → normalized [`VideoInfo`], through the format cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::error::{AppError, AppResult};
use crate::core::logging::sanitize_url_for_logging;
use crate::core::validation::NormalizedUrl;
use crate::download::formats::{normalize_video_info, VideoInfo};
use crate::download::source::ExtractionBackend;
use crate::storage::cache::{CacheStats, FormatCache};

pub struct FormatResolver {
    backend: Arc<dyn ExtractionBackend>,
    cache: FormatCache,
    timeout: Duration,
}

impl FormatResolver {
    pub fn new(backend: Arc<dyn ExtractionBackend>, cache: FormatCache, timeout: Duration) -> Self {
        Self { backend, cache, timeout }
    }

    pub fn backend(&self) -> &Arc<dyn ExtractionBackend> {
        &self.backend
    }

    /// Cached metadata for `url`, extracting it on a miss.
    pub async fn resolve(&self, url: &NormalizedUrl) -> AppResult<Arc<VideoInfo>> {
        self.cache
            .get_or_try_insert_with(url.cache_key(), self.extract(url))
            .await
    }

    /// Peek at the cache without extracting.
    pub async fn cached(&self, url: &NormalizedUrl) -> Option<Arc<VideoInfo>> {
        self.cache.get(url.cache_key()).await
    }

    pub async fn invalidate(&self, url: &NormalizedUrl) {
        self.cache.invalidate(url.cache_key()).await;
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    async fn extract(&self, url: &NormalizedUrl) -> AppResult<VideoInfo> {
        let safe_url = sanitize_url_for_logging(url.as_str());
        let started = Instant::now();

        let raw = tokio::time::timeout(self.timeout, self.backend.extract_metadata(url.url()))
            .await
            .map_err(|_| {
                AppError::ExtractionFailed(format!("metadata extraction timed out after {:?}", self.timeout))
            })
            .and_then(|result| result)
            .inspect_err(|e| log::warn!("Metadata extraction failed for {}: {}", safe_url, e))?;

        let info = normalize_video_info(raw)?;
        log::info!(
            "Resolved {} via {}: {} formats in {:?}",
            safe_url,
            self.backend.name(),
            info.formats.len(),
            started.elapsed()
        );
        Ok(info)
    }
}
