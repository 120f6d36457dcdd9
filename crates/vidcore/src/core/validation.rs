//! URL and format-selector validation
//!
//! Every user-supplied URL passes through [`UrlValidator`] before the backend
//! sees it:
//! - scheme allowlist (http/https by default)
//! - localhost-style host names rejected outright
//! - every address the host resolves to must be publicly routable, so a name that
//!   resolves to both a public and a private address is still rejected
//!
//! Format selectors end up on a command line and are checked against a character
//! allowlist by [`validate_format_id`].

use async_trait::async_trait;
use lazy_regex::regex_is_match;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use url::{Host, Url};

use crate::core::config::ValidationConfig;
use crate::core::error::{AppError, AppResult};

const BLOCKED_HOSTNAMES: &[&str] = &["localhost", "localhost.localdomain", "ip6-localhost", "ip6-loopback"];

/// Query parameters that only track the visitor and never select content.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "msclkid", "igshid", "si", "feature", "ref", "ref_src", "spm", "mc_cid", "mc_eid",
    "_ga",
];

const MAX_FORMAT_ID_LEN: usize = 500;

/// Resolves a host name to the addresses a connection could end up at.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system (`getaddrinfo` via tokio).
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// A URL that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedUrl {
    url: Url,
    cache_key: String,
}

impl NormalizedUrl {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// Key under which resolved formats for this URL are cached.
    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }
}

pub struct UrlValidator {
    allowed_schemes: Vec<String>,
    block_private_networks: bool,
    dns_timeout: Duration,
    resolver: Arc<dyn HostResolver>,
}

impl UrlValidator {
    pub fn new(config: &ValidationConfig) -> Self {
        Self::with_resolver(config, Arc::new(SystemResolver))
    }

    pub fn with_resolver(config: &ValidationConfig, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            allowed_schemes: config.allowed_schemes.iter().map(|s| s.to_ascii_lowercase()).collect(),
            block_private_networks: config.block_private_networks,
            dns_timeout: config.dns_timeout,
            resolver,
        }
    }

    /// Normalize and vet a raw URL.
    pub async fn validate(&self, raw: &str) -> AppResult<NormalizedUrl> {
        let url = self.check_syntax(raw)?;

        if self.block_private_networks {
            self.check_network(&url).await?;
        }

        let cache_key = normalize_cache_key(&url);
        Ok(NormalizedUrl { url, cache_key })
    }

    /// Parse, scheme and host-name checks. Does no I/O.
    fn check_syntax(&self, raw: &str) -> AppResult<Url> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AppError::InvalidUrl("URL is empty".to_string()));
        }

        let url = Url::parse(trimmed).map_err(|e| AppError::InvalidUrl(format!("cannot parse URL: {}", e)))?;

        if !self.allowed_schemes.iter().any(|s| s == url.scheme()) {
            return Err(AppError::InvalidUrl(format!("scheme '{}' is not allowed", url.scheme())));
        }

        match url.host() {
            None => return Err(AppError::InvalidUrl("URL has no host".to_string())),
            Some(Host::Domain(domain)) => {
                let domain = domain.trim_end_matches('.');
                if domain.is_empty() {
                    return Err(AppError::InvalidUrl("URL has no host".to_string()));
                }
                if self.block_private_networks && is_blocked_hostname(domain) {
                    return Err(AppError::InvalidUrl("local addresses are not allowed".to_string()));
                }
            }
            Some(_) => {}
        }

        Ok(url)
    }

    async fn check_network(&self, url: &Url) -> AppResult<()> {
        let addrs = match url.host() {
            Some(Host::Ipv4(ip)) => vec![IpAddr::V4(ip)],
            Some(Host::Ipv6(ip)) => vec![IpAddr::V6(ip)],
            Some(Host::Domain(domain)) => {
                let port = url.port_or_known_default().unwrap_or(443);
                let lookup = self.resolver.resolve(domain, port);
                match tokio::time::timeout(self.dns_timeout, lookup).await {
                    Ok(Ok(addrs)) => addrs,
                    Ok(Err(e)) => {
                        log::debug!("DNS resolution failed for {}: {}", domain, e);
                        return Err(AppError::InvalidUrl("host could not be resolved".to_string()));
                    }
                    Err(_) => return Err(AppError::InvalidUrl("host resolution timed out".to_string())),
                }
            }
            None => return Err(AppError::InvalidUrl("URL has no host".to_string())),
        };

        if addrs.is_empty() {
            return Err(AppError::InvalidUrl("host could not be resolved".to_string()));
        }

        if let Some(ip) = addrs.iter().find(|ip| is_blocked_ip(**ip)) {
            log::warn!("Rejected URL host resolving to non-public address {}", ip);
            return Err(AppError::InvalidUrl("private or local addresses are not allowed".to_string()));
        }

        Ok(())
    }
}

fn is_blocked_hostname(domain: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    BLOCKED_HOSTNAMES.contains(&domain.as_str()) || domain.ends_with(".localhost")
}

/// Whether a connection to `ip` could reach something other than the public internet.
///
/// # Examples
/// ```
/// use std::net::IpAddr;
/// use vidcore::core::validation::is_blocked_ip;
///
/// assert!(is_blocked_ip("127.0.0.1".parse::<IpAddr>().unwrap()));
/// assert!(is_blocked_ip("10.1.2.3".parse::<IpAddr>().unwrap()));
/// assert!(is_blocked_ip("::ffff:192.168.0.1".parse::<IpAddr>().unwrap()));
/// assert!(!is_blocked_ip("93.184.216.34".parse::<IpAddr>().unwrap()));
/// ```
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => is_blocked_v6(v6),
    }
}

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        // 0.0.0.0/8 "this network"
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (b & 0xc0) == 64)
        // 240.0.0.0/4 reserved
        || a >= 240
}

fn is_blocked_v6(ip: Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
        return true;
    }

    let segments = ip.segments();
    // fc00::/7 unique local
    if (segments[0] & 0xfe00) == 0xfc00 {
        return true;
    }
    // fe80::/10 link local
    if (segments[0] & 0xffc0) == 0xfe80 {
        return true;
    }

    // ::ffff:a.b.c.d and the deprecated ::a.b.c.d
    if let Some(v4) = ip.to_ipv4() {
        return is_blocked_v4(v4);
    }

    // 64:ff9b::/96 NAT64 embeds an IPv4 address in the low 32 bits
    if segments[..6] == [0x64, 0xff9b, 0, 0, 0, 0] {
        let [.., hi, lo] = segments;
        let v4 = Ipv4Addr::from((u32::from(hi) << 16) | u32::from(lo));
        return is_blocked_v4(v4);
    }

    false
}

/// Cache key for a validated URL: fragment and tracking parameters removed.
///
/// Scheme and host are already lower-cased and default ports dropped by the URL
/// parser.
pub fn normalize_cache_key(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        normalized.set_query(None);
    } else {
        normalized.query_pairs_mut().clear().extend_pairs(kept);
    }

    normalized.to_string()
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Check a backend format selector against the command-safe character set.
///
/// # Examples
/// ```
/// use vidcore::core::validation::validate_format_id;
///
/// assert!(validate_format_id("137+140").is_ok());
/// assert!(validate_format_id("bestvideo[height<=1080]+bestaudio/best").is_ok());
/// assert!(validate_format_id("18; rm -rf /").is_err());
/// assert!(validate_format_id("").is_err());
/// ```
pub fn validate_format_id(format_id: &str) -> AppResult<()> {
    if format_id.is_empty() || format_id.len() > MAX_FORMAT_ID_LEN {
        return Err(AppError::FormatNotAvailable("invalid format id length".to_string()));
    }
    if !regex_is_match!(r"^[a-zA-Z0-9+\[\]<>=^:/\-_.*,!?$]+$", format_id) {
        return Err(AppError::FormatNotAvailable("format id contains invalid characters".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    struct StaticResolver(HashMap<&'static str, Vec<IpAddr>>);

    #[async_trait]
    impl HostResolver for StaticResolver {
        async fn resolve(&self, host: &str, _port: u16) -> io::Result<Vec<IpAddr>> {
            self.0
                .get(host)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such host"))
        }
    }

    fn validator() -> UrlValidator {
        let ip = |s: &str| s.parse::<IpAddr>().unwrap();
        let mut hosts = HashMap::new();
        hosts.insert("video.example.com", vec![ip("93.184.216.34")]);
        hosts.insert("internal.example.com", vec![ip("10.0.0.5")]);
        hosts.insert("rebind.example.com", vec![ip("93.184.216.34"), ip("127.0.0.1")]);
        hosts.insert("v6.example.com", vec![ip("2606:2800:220:1::1")]);
        hosts.insert("ula.example.com", vec![ip("fd12:3456::1")]);
        hosts.insert("empty.example.com", vec![]);
        UrlValidator::with_resolver(&ValidationConfig::default(), Arc::new(StaticResolver(hosts)))
    }

    async fn reject(raw: &str) {
        let result = validator().validate(raw).await;
        assert!(matches!(result, Err(AppError::InvalidUrl(_))), "{} should be rejected", raw);
    }

    #[tokio::test]
    async fn test_public_url_accepted() {
        let normalized = validator()
            .validate("  https://Video.Example.com/watch?v=abc  ")
            .await
            .unwrap();
        assert_eq!(normalized.as_str(), "https://video.example.com/watch?v=abc");
        assert_eq!(normalized.url().host_str(), Some("video.example.com"));
    }

    #[tokio::test]
    async fn test_public_ipv6_host_accepted() {
        assert!(validator().validate("https://v6.example.com/v").await.is_ok());
        assert!(validator().validate("http://[2606:2800:220:1::1]/v").await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_bad_syntax_and_schemes() {
        reject("").await;
        reject("not a url").await;
        reject("ftp://video.example.com/file").await;
        reject("file:///etc/passwd").await;
        reject("javascript:alert(1)").await;
    }

    #[tokio::test]
    async fn test_rejects_local_literals_and_names() {
        reject("http://localhost/").await;
        reject("http://LOCALHOST./").await;
        reject("http://app.localhost/").await;
        reject("http://127.0.0.1:8080/").await;
        reject("http://0.0.0.0/").await;
        reject("http://[::1]/").await;
        reject("http://169.254.169.254/latest/meta-data").await;
        reject("http://192.168.1.1/").await;
        reject("http://100.64.0.1/").await;
        reject("http://[::ffff:10.0.0.1]/").await;
        reject("http://[fe80::1]/").await;
    }

    #[tokio::test]
    async fn test_rejects_names_resolving_to_private_space() {
        reject("https://internal.example.com/").await;
        reject("https://ula.example.com/").await;
        // One public and one loopback answer is still a rebinding vector
        reject("https://rebind.example.com/").await;
        reject("https://empty.example.com/").await;
        reject("https://unknown.example.com/").await;
    }

    #[tokio::test]
    async fn test_private_blocking_can_be_disabled() {
        let config = ValidationConfig {
            block_private_networks: false,
            ..ValidationConfig::default()
        };
        let validator = UrlValidator::with_resolver(&config, Arc::new(StaticResolver(HashMap::new())));
        assert!(validator.validate("http://127.0.0.1:9000/v.mp4").await.is_ok());
        // Scheme allowlist still applies
        assert!(validator.validate("ftp://127.0.0.1/").await.is_err());
    }

    #[test]
    fn test_nat64_embedded_v4() {
        assert!(is_blocked_ip("64:ff9b::a00:1".parse().unwrap()));
        assert!(!is_blocked_ip("64:ff9b::5db8:d822".parse().unwrap()));
    }

    #[test]
    fn test_cache_key_drops_tracking_and_fragment() {
        let url = Url::parse("HTTPS://WWW.Example.com:443/watch?v=abc&utm_source=x&si=123&t=10#comments").unwrap();
        assert_eq!(normalize_cache_key(&url), "https://www.example.com/watch?v=abc&t=10");

        let only_tracking = Url::parse("https://example.com/v?fbclid=1&UTM_medium=2").unwrap();
        assert_eq!(normalize_cache_key(&only_tracking), "https://example.com/v");
    }

    #[test]
    fn test_format_id_allowlist() {
        for ok in ["18", "137+140", "best", "bv*[height<=720]+ba/b", "hls-1080p", "dash_video.1"] {
            assert!(validate_format_id(ok).is_ok(), "{} should pass", ok);
        }
        for bad in ["18 140", "18;ls", "$(id)x`", "a|b", "a&b", "x\ny", "'quoted'"] {
            assert!(validate_format_id(bad).is_err(), "{} should fail", bad);
        }
        assert!(validate_format_id(&"1".repeat(MAX_FORMAT_ID_LEN + 1)).is_err());
    }
}
