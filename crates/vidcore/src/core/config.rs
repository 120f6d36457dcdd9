//! Engine configuration.
//!
//! Everything is plain serde data so the binary can layer defaults, a config file
//! and environment variables on top of each other. Durations are written as
//! seconds (fractions allowed) in every external representation.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Task/supervisor defaults
pub mod download {
    use super::Duration;

    /// Hard ceiling for a single download (1 hour)
    pub const DOWNLOAD_TIMEOUT_SECS: u64 = 3600;

    /// Metadata extraction timeout
    pub const RESOLVE_TIMEOUT_SECS: u64 = 120;

    /// No output for this long outside of merging counts as a stall
    pub const STALL_TIMEOUT_SECS: u64 = 300;

    /// Terminal tasks stay retrievable for this long (30 minutes)
    pub const TASK_RETENTION_SECS: u64 = 1800;

    /// Share of overall progress assigned to the first stream of a two-stream download
    pub const FIRST_STREAM_WEIGHT: f64 = 0.5;

    pub fn download_timeout() -> Duration {
        Duration::from_secs(DOWNLOAD_TIMEOUT_SECS)
    }

    pub fn resolve_timeout() -> Duration {
        Duration::from_secs(RESOLVE_TIMEOUT_SECS)
    }

    pub fn stall_timeout() -> Duration {
        Duration::from_secs(STALL_TIMEOUT_SECS)
    }

    pub fn task_retention() -> Duration {
        Duration::from_secs(TASK_RETENTION_SECS)
    }
}

/// Format cache defaults
pub mod cache {
    /// 10 minutes
    pub const TTL_SECS: u64 = 600;
    pub const MAX_ENTRIES: u64 = 128;
}

/// Delivery defaults
pub mod delivery {
    /// Read buffer per open stream (128 KiB)
    pub const STREAM_CHUNK_SIZE: usize = 128 * 1024;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub validation: ValidationConfig,
    pub cache: CacheConfig,
    pub tasks: TaskConfig,
    pub ytdlp: YtDlpConfig,
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub allowed_schemes: Vec<String>,
    /// Reject hosts resolving to private, loopback, link-local and similar ranges
    pub block_private_networks: bool,
    #[serde(with = "secs")]
    pub dns_timeout: Duration,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            allowed_schemes: vec!["http".to_string(), "https".to_string()],
            block_private_networks: true,
            dns_timeout: Duration::from_secs(5),
        }
    }
}

/// A zero `ttl` or zero `max_entries` disables caching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "secs")]
    pub ttl: Duration,
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(cache::TTL_SECS),
            max_entries: cache::MAX_ENTRIES,
        }
    }
}

impl CacheConfig {
    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero() && self.max_entries > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Each tracked task gets `<work_dir>/<task id>/`
    pub work_dir: PathBuf,
    #[serde(with = "secs")]
    pub resolve_timeout: Duration,
    #[serde(with = "secs")]
    pub spawn_timeout: Duration,
    #[serde(with = "secs")]
    pub stall_timeout: Duration,
    #[serde(with = "secs")]
    pub download_timeout: Duration,
    /// Time between SIGTERM and SIGKILL
    #[serde(with = "secs")]
    pub kill_grace: Duration,
    /// Upper bound for `cancel` waiting on the supervisor
    #[serde(with = "secs")]
    pub cancel_wait: Duration,
    #[serde(with = "secs")]
    pub retention: Duration,
    #[serde(with = "secs")]
    pub sweep_interval: Duration,
    /// Per-task broadcast capacity; slow subscribers lose the oldest events
    pub event_buffer: usize,
    pub first_stream_weight: f64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("vidcore"),
            resolve_timeout: download::resolve_timeout(),
            spawn_timeout: Duration::from_secs(10),
            stall_timeout: download::stall_timeout(),
            download_timeout: download::download_timeout(),
            kill_grace: Duration::from_secs(5),
            cancel_wait: Duration::from_secs(15),
            retention: download::task_retention(),
            sweep_interval: Duration::from_secs(60),
            event_buffer: 64,
            first_stream_weight: download::FIRST_STREAM_WEIGHT,
        }
    }
}

/// yt-dlp command-line tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct YtDlpConfig {
    pub binary: String,
    pub concurrent_fragments: u32,
    pub throttled_rate: String,
    pub buffer_size: String,
    pub http_chunk_size: Option<String>,
    pub socket_timeout: u32,
    pub retries: u32,
    pub fragment_retries: u32,
    pub extractor_retries: u32,
    pub file_access_retries: u32,
    pub sleep_requests: Option<f64>,
    pub user_agent: Option<String>,
    pub cookies_from_browser: Option<String>,
    pub proxy: Option<String>,
    /// Comma separated SponsorBlock categories, e.g. `sponsor,selfpromo`
    pub sponsorblock_remove: Option<String>,
    pub merge_output_format: String,
}

impl Default for YtDlpConfig {
    fn default() -> Self {
        Self {
            binary: "yt-dlp".to_string(),
            concurrent_fragments: 4,
            throttled_rate: "100K".to_string(),
            buffer_size: "128K".to_string(),
            http_chunk_size: None,
            socket_timeout: 30,
            retries: 10,
            fragment_retries: 10,
            extractor_retries: 3,
            file_access_retries: 3,
            sleep_requests: None,
            user_agent: None,
            cookies_from_browser: None,
            proxy: None,
            sponsorblock_remove: None,
            merge_output_format: "mp4".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Read buffer for streaming artifacts and direct pipes, allocated per open stream
    pub stream_chunk_size: usize,
    /// Bytes of stderr kept from a direct-mode process for diagnostics
    pub stderr_tail_bytes: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            stream_chunk_size: delivery::STREAM_CHUNK_SIZE,
            stderr_tail_bytes: 64 * 1024,
        }
    }
}

/// `Duration` <-> seconds as a float.
mod secs {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(de::Error::custom)
    }
}
