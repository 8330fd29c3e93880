use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::util::{is_url_safe, sanitize_text, PLACEHOLDER_HREF};

/// A subscribable feed endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSource {
    /// Display name
    pub title: String,
    /// Canonical fetch endpoint; also the source's identity
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FeedSource {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Publication date as it appeared in the feed, plus its parsed form.
///
/// `parsed` is `None` when the raw text is neither RFC 2822 (RSS) nor
/// RFC 3339 (Atom).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedAt {
    pub raw: String,
    pub parsed: Option<DateTime<Utc>>,
}

impl PublishedAt {
    pub fn from_raw(raw: String) -> Self {
        let parsed = DateTime::parse_from_rfc2822(&raw)
            .or_else(|_| DateTime::parse_from_rfc3339(&raw))
            .map(|dt| dt.with_timezone(&Utc))
            .ok();
        Self { raw, parsed }
    }
}

/// One normalized, sanitized feed entry.
///
/// Every text field has been through [`sanitize_text`]. `link` is either an
/// `http(s)` URL that passed [`is_url_safe`] or [`PLACEHOLDER_HREF`], in which
/// case `link_safe` is false and the item must not be rendered as navigable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub published: Option<PublishedAt>,
    pub author: Option<String>,
    pub summary: Option<String>,
    /// Host of the feed the item came from, not of the item link
    pub source_host: String,
    pub link_safe: bool,
    key: String,
}

/// Untrusted field values extracted from one `<item>`/`<entry>`.
#[derive(Debug, Default, Clone)]
pub struct RawItem {
    pub title: String,
    pub link: String,
    pub published: String,
    pub author: String,
    pub summary: String,
}

impl FeedItem {
    /// Sanitizes raw field values into an item.
    pub fn from_raw(raw: RawItem, source_host: &str) -> Self {
        let title = sanitize_text(&raw.title);
        let summary = non_empty(sanitize_text(&raw.summary));
        let author = non_empty(sanitize_text(&raw.author));
        let published = non_empty(sanitize_text(&raw.published)).map(PublishedAt::from_raw);

        let raw_link = raw.link.trim();
        let link_safe = is_url_safe(raw_link);

        let (link, key) = if link_safe {
            (raw_link.to_string(), raw_link.to_string())
        } else {
            if !raw_link.is_empty() {
                tracing::debug!(
                    source = %source_host,
                    title = %title,
                    "Neutralized unsafe item link"
                );
            }
            let key = blocked_link_key(source_host, &title, raw_link);
            (PLACEHOLDER_HREF.to_string(), key)
        };

        Self {
            title,
            link,
            published,
            author,
            summary,
            source_host: source_host.to_string(),
            link_safe,
            key,
        }
    }

    /// Identity used for deduplication.
    ///
    /// The link itself for safe items. Neutralized items all share the
    /// placeholder link, so they are keyed by a digest of where they came from
    /// and what they pointed at instead.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Parsed publication time, if the feed supplied a recognizable date.
    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.published.as_ref().and_then(|p| p.parsed)
    }

    /// Case-insensitive substring match against title or summary.
    ///
    /// `needle` must already be lowercased.
    pub(crate) fn matches_lowercase(&self, needle: &str) -> bool {
        self.title.to_lowercase().contains(needle)
            || self
                .summary
                .as_deref()
                .is_some_and(|s| s.to_lowercase().contains(needle))
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn blocked_link_key(source_host: &str, title: &str, raw_link: &str) -> String {
    let input = format!("{}|{}|{}", source_host, title, raw_link);
    let hash = Sha256::digest(input.as_bytes());
    format!("unsafe:{:x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn raw(title: &str, link: &str) -> RawItem {
        RawItem {
            title: title.to_string(),
            link: link.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_safe_item_keyed_by_link() {
        let item = FeedItem::from_raw(raw("Patch Tuesday", "https://example.com/a"), "example.com");
        assert!(item.link_safe);
        assert_eq!(item.link, "https://example.com/a");
        assert_eq!(item.key(), "https://example.com/a");
    }

    #[test]
    fn test_unsafe_link_replaced() {
        let item = FeedItem::from_raw(raw("<b>Alert</b>", "javascript:alert(1)"), "example.com");
        assert_eq!(item.title, "Alert");
        assert!(!item.link_safe);
        assert_eq!(item.link, PLACEHOLDER_HREF);
        assert!(item.key().starts_with("unsafe:"));
    }

    #[test]
    fn test_distinct_unsafe_items_have_distinct_keys() {
        let a = FeedItem::from_raw(raw("One", "javascript:a()"), "example.com");
        let b = FeedItem::from_raw(raw("Two", "javascript:b()"), "example.com");
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_empty_optional_fields_are_none() {
        let item = FeedItem::from_raw(raw("Title", "https://example.com"), "example.com");
        assert_eq!(item.summary, None);
        assert_eq!(item.author, None);
        assert_eq!(item.published, None);
    }

    #[test]
    fn test_published_rfc2822() {
        let published = PublishedAt::from_raw("Tue, 10 Jun 2025 04:00:00 GMT".to_string());
        let parsed = published.parsed.unwrap();
        assert_eq!(parsed.to_rfc3339(), "2025-06-10T04:00:00+00:00");
    }

    #[test]
    fn test_published_rfc3339() {
        let published = PublishedAt::from_raw("2025-06-10T06:00:00+02:00".to_string());
        assert_eq!(
            published.parsed.unwrap().to_rfc3339(),
            "2025-06-10T04:00:00+00:00"
        );
    }

    #[test]
    fn test_published_unparseable_keeps_raw() {
        let published = PublishedAt::from_raw("yesterday".to_string());
        assert_eq!(published.raw, "yesterday");
        assert_eq!(published.parsed, None);
    }

    #[test]
    fn test_matches_title_or_summary() {
        let mut r = raw("LockBit Returns", "https://example.com/x");
        r.summary = "New <i>ransomware</i> variant".to_string();
        let item = FeedItem::from_raw(r, "example.com");
        assert!(item.matches_lowercase("lockbit"));
        assert!(item.matches_lowercase("ransomware"));
        assert!(!item.matches_lowercase("phishing"));
    }
}
