//! Classification of yt-dlp failures from their stderr text.

use crate::core::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum YtDlpErrorType {
    /// Private, removed, region-locked or otherwise missing
    VideoUnavailable,
    /// No extractor for the site
    UnsupportedUrl,
    /// Requested format selector matched nothing
    FormatUnavailable,
    /// Live broadcasts cannot be downloaded as a file
    Livestream,
    /// Timeouts, DNS, refused connections
    NetworkError,
    Unknown,
}

/// Classify yt-dlp stderr.
///
/// Checks run most-specific first; the first match wins.
pub fn analyze_ytdlp_error(stderr: &str) -> YtDlpErrorType {
    let stderr_lower = stderr.to_lowercase();

    if stderr_lower.contains("unsupported url") || stderr_lower.contains("no suitable extractor") {
        return YtDlpErrorType::UnsupportedUrl;
    }

    if stderr_lower.contains("requested format is not available")
        || stderr_lower.contains("requested format not available")
        || stderr_lower.contains("format is not available")
    {
        return YtDlpErrorType::FormatUnavailable;
    }

    if stderr_lower.contains("is live")
        || stderr_lower.contains("livestream")
        || stderr_lower.contains("live event will begin")
        || stderr_lower.contains("premieres in")
    {
        return YtDlpErrorType::Livestream;
    }

    if stderr_lower.contains("private video")
        || stderr_lower.contains("video unavailable")
        || stderr_lower.contains("is not available")
        || stderr_lower.contains("has been removed")
        || stderr_lower.contains("does not exist")
        || stderr_lower.contains("not found")
        || stderr_lower.contains("http error 404")
    {
        return YtDlpErrorType::VideoUnavailable;
    }

    if stderr_lower.contains("timed out")
        || stderr_lower.contains("timeout")
        || stderr_lower.contains("connection")
        || stderr_lower.contains("network is unreachable")
        || stderr_lower.contains("name or service not known")
        || stderr_lower.contains("failed to resolve")
    {
        return YtDlpErrorType::NetworkError;
    }

    YtDlpErrorType::Unknown
}

/// Map a classified metadata failure onto the engine's error taxonomy.
///
/// `detail` is kept for logs only; it never reaches a client through
/// [`AppError::public_message`].
pub fn into_app_error(error_type: YtDlpErrorType, detail: &str) -> AppError {
    match error_type {
        YtDlpErrorType::VideoUnavailable => AppError::NotFound,
        YtDlpErrorType::UnsupportedUrl => AppError::UnsupportedPlatform,
        YtDlpErrorType::FormatUnavailable => AppError::FormatNotAvailable("requested format is not available".to_string()),
        YtDlpErrorType::Livestream => AppError::FormatNotAvailable("live streams cannot be downloaded".to_string()),
        YtDlpErrorType::NetworkError | YtDlpErrorType::Unknown => {
            AppError::ExtractionFailed(format!("{}: {}", error_type, last_error_line(detail)))
        }
    }
}

/// Last `ERROR:` line, or the last non-empty line.
pub fn last_error_line(stderr: &str) -> &str {
    let mut lines = stderr.lines().map(str::trim).filter(|l| !l.is_empty());
    let last_error = stderr.lines().rev().map(str::trim).find(|l| l.starts_with("ERROR:"));
    last_error.or_else(|| lines.next_back()).unwrap_or("")
}
