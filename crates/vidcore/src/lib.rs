//! vidcore — download orchestration engine.
//!
//! Resolves a user-supplied URL into normalized format metadata, supervises an
//! external extractor/downloader per task, folds its progress output into a
//! task state machine and fans that state out to subscribers.
//!
//! The entry point is [`service::DownloadService`].

pub mod core;
pub mod download;
pub mod service;
pub mod storage;

pub use crate::core::config::EngineConfig;
pub use crate::core::error::{AppError, AppResult, ErrorCode};
pub use crate::download::formats::{DeliveryMode, Format, VideoInfo};
pub use crate::download::task::{TaskPhase, TaskSnapshot, TaskStatus};
pub use crate::service::DownloadService;
