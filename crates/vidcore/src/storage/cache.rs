//! TTL + LRU cache for resolved format metadata.
//!
//! Keyed by the normalized URL. Values are immutable `Arc<VideoInfo>`; a refresh
//! replaces the entry wholesale. Concurrent misses for the same key share a single
//! extraction call.

use moka::future::Cache;
use moka::policy::EvictionPolicy;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::config::CacheConfig;
use crate::core::error::{AppError, AppResult};
use crate::download::formats::VideoInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

pub struct FormatCache {
    /// `None` when caching is disabled
    inner: Option<Cache<String, Arc<VideoInfo>>>,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl FormatCache {
    pub fn new(config: &CacheConfig) -> Self {
        let inner = config.is_enabled().then(|| {
            Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(config.ttl)
                .eviction_policy(EvictionPolicy::lru())
                .build()
        });
        Self {
            inner,
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Return the cached value or run `init` once to produce it.
    ///
    /// Failures are not cached.
    pub async fn get_or_try_insert_with<F>(&self, key: &str, init: F) -> AppResult<Arc<VideoInfo>>
    where
        F: Future<Output = AppResult<VideoInfo>>,
    {
        let Some(cache) = &self.inner else {
            self.miss_count.fetch_add(1, Ordering::Relaxed);
            return init.await.map(Arc::new);
        };

        let loaded = AtomicBool::new(false);
        let result = cache
            .try_get_with(key.to_string(), async {
                loaded.store(true, Ordering::Relaxed);
                init.await.map(Arc::new)
            })
            .await;

        if loaded.load(Ordering::Relaxed) {
            self.miss_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
        }

        result.map_err(|shared| AppError::from_shared(&shared))
    }

    pub async fn get(&self, key: &str) -> Option<Arc<VideoInfo>> {
        self.inner.as_ref()?.get(key).await
    }

    pub async fn invalidate(&self, key: &str) {
        if let Some(cache) = &self.inner {
            cache.invalidate(key).await;
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = match &self.inner {
            Some(cache) => {
                cache.run_pending_tasks().await;
                cache.entry_count()
            }
            None => 0,
        };
        CacheStats {
            hits: self.hit_count.load(Ordering::Relaxed),
            misses: self.miss_count.load(Ordering::Relaxed),
            entries,
        }
    }
}
