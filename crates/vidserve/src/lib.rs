//! vidserve — HTTP front end for the vidcore download engine.
//!
//! Exposes format resolution, tracked downloads with live progress (SSE) and
//! one-shot direct downloads under `/api/v1`.

pub mod cli;
pub mod config;
pub mod error;
pub mod web_server;

pub use config::ServerConfig;
pub use error::ApiError;
