//! Configuration file parser for ~/.config/feedsentry/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are ignored by serde, though we log a warning when the file
//! contains potential typos.
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::feed::{
    default_backends, FeedSource, ProxyBackend, RetryPolicy, Transport,
    DEFAULT_MAX_CONCURRENT_SOURCES, DEFAULT_STALENESS,
};
use crate::feed::transport::{DEFAULT_MAX_BODY_BYTES, DEFAULT_REQUEST_TIMEOUT};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Retry settings for one source load.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_secs: policy.max_delay.as_secs(),
        }
    }
}

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cached feed results younger than this are reused.
    pub staleness_secs: u64,

    /// Per-backend request timeout.
    pub request_timeout_secs: u64,

    /// Largest feed body accepted from a proxy.
    pub max_feed_bytes: usize,

    /// Sources loaded concurrently by `fetch`.
    pub max_concurrent_sources: usize,

    pub retry: RetryConfig,

    /// Ordered proxy backends; the first to succeed wins.
    pub proxies: Vec<ProxyBackend>,

    /// Built-in sources. User-added sources live in the state database.
    pub sources: Vec<FeedSource>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            staleness_secs: DEFAULT_STALENESS.as_secs(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            max_feed_bytes: DEFAULT_MAX_BODY_BYTES,
            max_concurrent_sources: DEFAULT_MAX_CONCURRENT_SOURCES,
            retry: RetryConfig::default(),
            proxies: default_backends(),
            sources: default_sources(),
        }
    }
}

/// Security news feeds subscribed out of the box.
pub fn default_sources() -> Vec<FeedSource> {
    vec![
        FeedSource::new(
            "Bleeping Computer",
            "https://feeds.feedburner.com/bleepingcomputer/dokidoneebm",
        )
        .with_description("Latest cybersecurity news and articles"),
        FeedSource::new(
            "Krebs on Security",
            "https://feeds.feedburner.com/krebsonsecurity/2p0rdzgpxcm",
        )
        .with_description("In-depth security news and investigation"),
        FeedSource::new("The Hacker News", "https://feeds.feedburner.com/TheHackersNews")
            .with_description("Cybersecurity news and analysis"),
        FeedSource::new(
            "CISA Advisories",
            "https://www.cisa.gov/uscert/ncas/current-activity.xml",
        )
        .with_description("Current activity from US-CERT/CISA"),
        FeedSource::new("Dark Reading", "https://www.darkreading.com/rss.xml")
            .with_description("Connecting the cybersecurity community"),
        FeedSource::new(
            "Qualys Threat Protection",
            "https://threatprotect.qualys.com/feed/",
        )
        .with_description("Threat intelligence from Qualys"),
    ]
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            tracing::debug!("Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(content)?;
        tracing::info!(
            sources = config.sources.len(),
            proxies = config.proxies.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_secs(self.retry.max_delay_secs),
        }
    }

    /// Transport over the configured proxies with the configured limits.
    pub fn transport(&self, client: reqwest::Client) -> Transport {
        Transport::new(client, self.proxies.clone())
            .with_request_timeout(self.request_timeout())
            .with_max_body_bytes(self.max_feed_bytes)
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    const KNOWN_KEYS: [&str; 7] = [
        "staleness_secs",
        "request_timeout_secs",
        "max_feed_bytes",
        "max_concurrent_sources",
        "retry",
        "proxies",
        "sources",
    ];
    const KNOWN_RETRY_KEYS: [&str; 3] = ["max_attempts", "base_delay_ms", "max_delay_secs"];

    for key in raw.keys() {
        if !KNOWN_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
        }
    }
    if let Some(retry) = raw.get("retry").and_then(|v| v.as_table()) {
        for key in retry.keys() {
            if !KNOWN_RETRY_KEYS.contains(&key.as_str()) {
                tracing::warn!(key = %format!("retry.{}", key), "Unknown key in config file, ignoring");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
