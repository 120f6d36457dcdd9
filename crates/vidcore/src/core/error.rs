use serde::Serialize;
use thiserror::Error;

/// Centralized error type for the engine.
///
/// Input errors carry a message that is safe to show to the caller. Operational
/// errors keep their detail for the logs; callers get [`AppError::public_message`].
///
/// # Example
///
/// ```
/// use vidcore::core::error::{AppError, ErrorCode};
///
/// let err = AppError::InvalidUrl("unsupported scheme: ftp".to_string());
/// assert_eq!(err.code(), ErrorCode::InvalidUrl);
/// assert_eq!(err.public_message(), "Invalid URL: unsupported scheme: ftp");
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    /// URL failed parsing, scheme allowlist or network safety checks
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The backend reports the video as missing, private or removed
    #[error("Video not found")]
    NotFound,

    /// Unknown or evicted task id
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// No extractor for this site
    #[error("Unsupported platform")]
    UnsupportedPlatform,

    /// Requested format id is unknown or not allowed
    #[error("Format not available: {0}")]
    FormatNotAvailable(String),

    /// Backend invocation failed, timed out or produced unparseable output
    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    /// Result requested before the task completed
    #[error("Download is not ready (status: {0})")]
    ResultNotReady(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Type alias for Result with AppError
pub type AppResult<T> = Result<T, AppError>;

/// Stable, client-facing error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidUrl,
    NotFound,
    UnsupportedPlatform,
    FormatNotAvailable,
    ExtractionFailed,
    InternalError,
}

impl AppError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::InvalidUrl(_) => ErrorCode::InvalidUrl,
            AppError::NotFound | AppError::TaskNotFound(_) | AppError::ResultNotReady(_) => ErrorCode::NotFound,
            AppError::UnsupportedPlatform => ErrorCode::UnsupportedPlatform,
            AppError::FormatNotAvailable(_) => ErrorCode::FormatNotAvailable,
            AppError::ExtractionFailed(_) => ErrorCode::ExtractionFailed,
            AppError::Io(_) | AppError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Message suitable for returning to a client.
    ///
    /// Operational failures collapse to a generic sentence so that backend stderr,
    /// filesystem paths and similar detail never leave the process.
    pub fn public_message(&self) -> String {
        match self {
            AppError::ExtractionFailed(_) => "Failed to extract video information".to_string(),
            AppError::Io(_) | AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether the cause is worth an error-level log line.
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            AppError::ExtractionFailed(_) | AppError::Io(_) | AppError::Internal(_)
        )
    }

    /// Rebuild an error that was shared between coalesced callers.
    pub(crate) fn from_shared(err: &AppError) -> AppError {
        match err {
            AppError::InvalidUrl(m) => AppError::InvalidUrl(m.clone()),
            AppError::NotFound => AppError::NotFound,
            AppError::TaskNotFound(id) => AppError::TaskNotFound(id.clone()),
            AppError::UnsupportedPlatform => AppError::UnsupportedPlatform,
            AppError::FormatNotAvailable(m) => AppError::FormatNotAvailable(m.clone()),
            AppError::ExtractionFailed(m) => AppError::ExtractionFailed(m.clone()),
            AppError::ResultNotReady(s) => AppError::ResultNotReady(s.clone()),
            AppError::Io(e) => AppError::Internal(e.to_string()),
            AppError::Internal(m) => AppError::Internal(m.clone()),
        }
    }
}
