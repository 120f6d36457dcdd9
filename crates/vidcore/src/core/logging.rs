//! Logging bootstrap and log-safe URL rendering
//!
//! The engine logs through the `log` facade; [`init_tracing`] installs a
//! `tracing-subscriber` formatter and bridges `log` records into it, so both
//! facades end up in the same output.

use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;
use url::Url;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `default_filter` when set. Calling this twice is harmless:
/// the second call returns an error that callers may ignore.
pub fn init_tracing(default_filter: &str) -> Result<(), String> {
    tracing_log::LogTracer::init().map_err(|e| format!("Failed to bridge log records: {}", e))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| format!("Failed to initialize tracing: {}", e))
}

/// Render a URL for log output without its query string or credentials.
///
/// The suffix is the first 8 hex characters of the SHA-256 of the full URL, which
/// is enough to correlate log lines for the same request.
///
/// # Examples
/// ```
/// use vidcore::core::logging::sanitize_url_for_logging;
///
/// let safe = sanitize_url_for_logging("https://user:pw@example.com/watch?v=abc&token=s3cret");
/// assert!(safe.starts_with("https://example.com/watch (hash:"));
/// assert!(!safe.contains("s3cret"));
/// assert!(!safe.contains("pw"));
/// ```
pub fn sanitize_url_for_logging(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    let hash = hex::encode(&digest[..4]);

    match Url::parse(raw.trim()) {
        Ok(url) => format!(
            "{}://{}{} (hash:{})",
            url.scheme(),
            url.host_str().unwrap_or(""),
            url.path(),
            hash
        ),
        Err(_) => format!("<unparseable url> (hash:{})", hash),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_is_stable_per_url() {
        let a = sanitize_url_for_logging("https://example.com/v?id=1");
        let b = sanitize_url_for_logging("https://example.com/v?id=1");
        let c = sanitize_url_for_logging("https://example.com/v?id=2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.ends_with(')'));
        assert_eq!(a.len(), "https://example.com/v (hash:xxxxxxxx)".len());
    }

    #[test]
    fn test_sanitize_unparseable() {
        let out = sanitize_url_for_logging("not a url");
        assert!(out.starts_with("<unparseable url> (hash:"));
    }
}
