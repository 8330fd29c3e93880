use std::net::IpAddr;
use thiserror::Error;
use url::Url;

use super::sanitize::is_url_safe;

/// Errors that can occur while validating a feed URL.
///
/// A source whose URL fails validation is never fetched. The host checks exist
/// to keep feed configuration from reaching into the local network (SSRF).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The URL was empty or whitespace.
    #[error("URL is required")]
    Required,
    /// The URL uses a blocked scheme, a non-HTTP(S) scheme, or does not parse.
    #[error("URL contains unsafe protocol or format")]
    UnsafeUrl,
    /// The URL has no usable hostname.
    #[error("Invalid hostname in URL")]
    InvalidHost,
    /// The URL points to localhost, a loopback address or a private range.
    #[error("Private/local URLs are not allowed: {0}")]
    PrivateAddress(String),
}

/// Validates a URL for use as a feed source.
///
/// Rejects, in order:
/// - empty input ([`ValidationError::Required`])
/// - anything [`is_url_safe`] rejects ([`ValidationError::UnsafeUrl`])
/// - a missing or shorter-than-3-character host ([`ValidationError::InvalidHost`])
/// - `localhost`, loopback, `10.*`, `172.*`, `192.168.*`, link-local,
///   unspecified and IPv6 unique-local hosts ([`ValidationError::PrivateAddress`])
///
/// # Examples
///
/// ```
/// use feedsentry::util::{validate_feed_url, ValidationError};
///
/// let url = validate_feed_url("https://example.com/feed.xml").unwrap();
/// assert_eq!(url.host_str(), Some("example.com"));
///
/// assert_eq!(validate_feed_url(""), Err(ValidationError::Required));
/// assert!(validate_feed_url("http://192.168.1.1/feed").is_err());
/// assert!(validate_feed_url("file:///etc/passwd").is_err());
/// ```
pub fn validate_feed_url(url_str: &str) -> Result<Url, ValidationError> {
    let trimmed = url_str.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Required);
    }

    if !is_url_safe(trimmed) {
        return Err(ValidationError::UnsafeUrl);
    }

    let url = Url::parse(trimmed).map_err(|_| ValidationError::UnsafeUrl)?;

    let host = match url.host_str() {
        Some(host) if host.len() >= 3 => host.to_lowercase(),
        _ => return Err(ValidationError::InvalidHost),
    };

    if is_local_host(&host) {
        return Err(ValidationError::PrivateAddress(host));
    }

    Ok(url)
}

fn is_local_host(host: &str) -> bool {
    // Fully qualified form resolves the same as the bare name
    let host = host.strip_suffix('.').unwrap_or(host);

    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if host.starts_with("10.") || host.starts_with("172.") || host.starts_with("192.168.") {
        return true;
    }

    // Strip brackets from IPv6 addresses for parsing
    let host_for_parse = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    match host_for_parse.parse::<IpAddr>() {
        Ok(ip) => is_private_ip(&ip),
        Err(_) => false,
    }
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() || ipv6.is_unspecified() {
                return true;
            }
            if let Some(mapped) = ipv6.to_ipv4_mapped() {
                return is_private_ip(&IpAddr::V4(mapped));
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_urls() {
        assert!(validate_feed_url("https://example.com/feed.xml").is_ok());
        assert!(validate_feed_url("http://news.example.org").is_ok());
        assert!(validate_feed_url("  https://www.cisa.gov/news.xml  ").is_ok());
    }

    #[test]
    fn test_empty_is_required() {
        assert_eq!(validate_feed_url(""), Err(ValidationError::Required));
        assert_eq!(validate_feed_url("   "), Err(ValidationError::Required));
        assert_eq!(ValidationError::Required.to_string(), "URL is required");
    }

    #[test]
    fn test_unsafe_schemes_rejected() {
        assert_eq!(
            validate_feed_url("javascript:alert(1)"),
            Err(ValidationError::UnsafeUrl)
        );
        assert_eq!(
            validate_feed_url("file:///etc/passwd"),
            Err(ValidationError::UnsafeUrl)
        );
        assert_eq!(
            validate_feed_url("ftp://example.com"),
            Err(ValidationError::UnsafeUrl)
        );
    }

    #[test]
    fn test_short_host_rejected() {
        assert_eq!(
            validate_feed_url("http://ab/feed"),
            Err(ValidationError::InvalidHost)
        );
    }

    #[test]
    fn test_localhost_rejected() {
        assert!(matches!(
            validate_feed_url("http://localhost/feed"),
            Err(ValidationError::PrivateAddress(_))
        ));
        assert!(validate_feed_url("http://LOCALHOST:8080/feed").is_err());
        assert!(validate_feed_url("http://127.0.0.1/feed").is_err());
        assert!(validate_feed_url("http://127.8.9.10/feed").is_err());
        assert!(validate_feed_url("http://api.localhost/feed").is_err());
        assert!(matches!(
            validate_feed_url("http://localhost./feed"),
            Err(ValidationError::PrivateAddress(_))
        ));
        assert!(validate_feed_url("http://api.localhost./feed").is_err());
        assert!(validate_feed_url("http://example.com./feed").is_ok());
    }

    #[test]
    fn test_private_ranges_rejected() {
        assert!(validate_feed_url("http://192.168.1.1/feed").is_err());
        assert!(validate_feed_url("http://10.0.0.1/feed").is_err());
        assert!(validate_feed_url("http://172.16.0.1/feed").is_err());
        // The whole 172.* prefix is blocked, not only 172.16.0.0/12
        assert!(validate_feed_url("http://172.64.1.1/feed").is_err());
    }

    #[test]
    fn test_ipv6_local_rejected() {
        assert!(validate_feed_url("http://[::1]/feed").is_err());
        assert!(validate_feed_url("http://[fe80::1]/feed").is_err());
        assert!(validate_feed_url("http://[fd00::1]/feed").is_err());
        assert!(validate_feed_url("http://[::ffff:192.168.0.1]/feed").is_err());
    }

    #[test]
    fn test_link_local_and_zero_rejected() {
        assert!(validate_feed_url("http://169.254.1.1/feed").is_err());
        assert!(validate_feed_url("http://0.0.0.0/feed").is_err());
    }

    #[test]
    fn test_url_with_port_on_private_ip() {
        assert!(validate_feed_url("http://192.168.1.1:8080/feed").is_err());
        assert!(validate_feed_url("http://10.0.0.1:3000/feed").is_err());
    }

    #[test]
    fn test_public_ip_accepted() {
        assert!(validate_feed_url("http://93.184.216.34/feed").is_ok());
    }
}
