//! End-to-end tests for the ingestion pipeline: proxy fallback, parsing,
//! sanitization, indexing and watchlist matching.
//!
//! Proxy backends are served by a single wiremock server, one path per
//! backend. Each test builds its own ingestor and in-memory database.

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use feedsentry::feed::{
    FeedIngestor, FeedSource, LoadStatus, ProxyBackend, RetryPolicy, Transport,
};
use feedsentry::search::SearchIndex;
use feedsentry::storage::Database;
use feedsentry::util::PLACEHOLDER_HREF;
use feedsentry::watchlist::{AddOutcome, Watchlist};

const ALERTS_URL: &str = "https://alerts.example.com/rss";
const ATOM_URL: &str = "https://atom.example.com/feed";

const ALERTS_RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <channel>
    <title>Alerts</title>
    <item>
      <title>&lt;b&gt;Alert&lt;/b&gt;</title>
      <link>javascript:alert(1)</link>
      <description>Ransomware <![CDATA[<img src=x onerror=alert(1)>]]>campaign</description>
      <pubDate>Tue, 10 Jun 2025 04:00:00 GMT</pubDate>
      <dc:creator>CERT</dc:creator>
    </item>
    <item>
      <title>Critical VPN flaw exploited</title>
      <link>https://alerts.example.com/vpn</link>
      <description>Patch now</description>
    </item>
  </channel>
</rss>"#;

const ATOM_FEED: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom News</title>
  <entry>
    <title>Ransomware gang arrested</title>
    <link rel="alternate" href="https://atom.example.com/arrest"/>
    <updated>2025-06-11T08:00:00Z</updated>
    <summary>Police seized servers</summary>
    <author><name>Reporter</name></author>
  </entry>
  <entry>
    <title>Duplicate of the VPN story</title>
    <link href="https://alerts.example.com/vpn"/>
  </entry>
</feed>"#;

fn backends(server: &MockServer) -> Vec<ProxyBackend> {
    vec![
        ProxyBackend::envelope("primary", &format!("{}/primary?url=", server.uri()), "contents"),
        ProxyBackend::envelope("secondary", &format!("{}/secondary?url=", server.uri()), "contents"),
        ProxyBackend::raw("raw", &format!("{}/raw?url=", server.uri())),
    ]
}

fn ingestor(server: &MockServer) -> FeedIngestor {
    let transport = Transport::new(reqwest::Client::new(), backends(server))
        .with_request_timeout(Duration::from_secs(5));
    FeedIngestor::new(transport, Arc::new(SearchIndex::new())).with_retry_policy(RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    })
}

async fn mount_feed(server: &MockServer, backend: &str, feed_url: &str, body: &str) {
    Mock::given(path(format!("/{}", backend)))
        .and(query_param("url", feed_url))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

async fn mount_failure(server: &MockServer, backend: &str, status: u16) {
    Mock::given(path(format!("/{}", backend)))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

// ============================================================================
// Fetch and sanitize
// ============================================================================

#[tokio::test]
async fn test_falls_back_to_third_backend_and_sanitizes() {
    let server = MockServer::start().await;
    mount_failure(&server, "primary", 500).await;
    mount_failure(&server, "secondary", 503).await;
    mount_feed(&server, "raw", ALERTS_URL, ALERTS_RSS).await;

    let ingestor = ingestor(&server);
    ingestor
        .add_source(FeedSource::new("Alerts", ALERTS_URL))
        .unwrap();

    let state = ingestor.load(ALERTS_URL).await.unwrap();
    assert_eq!(state.status, LoadStatus::Ready);
    assert_eq!(state.items.len(), 2);

    let alert = &state.items[0];
    assert_eq!(alert.title, "Alert");
    assert_eq!(alert.link, PLACEHOLDER_HREF);
    assert!(!alert.link_safe);
    assert_eq!(alert.summary.as_deref(), Some("Ransomware campaign"));
    assert_eq!(alert.author.as_deref(), Some("CERT"));
    assert_eq!(alert.source_host, "alerts.example.com");
    assert!(alert.published_at().is_some());

    let vpn = &state.items[1];
    assert!(vpn.link_safe);
    assert_eq!(vpn.link, "https://alerts.example.com/vpn");
}

#[tokio::test]
async fn test_envelope_backend_serves_document() {
    let server = MockServer::start().await;
    Mock::given(path("/primary"))
        .and(query_param("url", ATOM_URL))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "contents": ATOM_FEED })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(path("/raw"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ATOM_FEED))
        .expect(0)
        .mount(&server)
        .await;

    let ingestor = ingestor(&server);
    ingestor.add_source(FeedSource::new("Atom", ATOM_URL)).unwrap();

    let state = ingestor.load(ATOM_URL).await.unwrap();
    assert_eq!(state.items[0].link, "https://atom.example.com/arrest");
    assert_eq!(state.items[0].author.as_deref(), Some("Reporter"));
}

#[tokio::test]
async fn test_all_backends_failing_reports_error() {
    let server = MockServer::start().await;
    mount_failure(&server, "primary", 500).await;
    mount_failure(&server, "secondary", 500).await;
    mount_failure(&server, "raw", 404).await;

    let ingestor = ingestor(&server);
    ingestor
        .add_source(FeedSource::new("Alerts", ALERTS_URL))
        .unwrap();

    let state = ingestor.load(ALERTS_URL).await.unwrap();
    assert_eq!(state.status, LoadStatus::Errored);
    assert!(state.error().unwrap().contains("404"));
    assert!(state.items.is_empty());
}

#[tokio::test]
async fn test_cached_state_served_within_staleness_window() {
    let server = MockServer::start().await;
    Mock::given(path("/primary"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "contents": ALERTS_RSS })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let ingestor = ingestor(&server);
    ingestor
        .add_source(FeedSource::new("Alerts", ALERTS_URL))
        .unwrap();

    let first = ingestor.load(ALERTS_URL).await.unwrap();
    let second = ingestor.load(ALERTS_URL).await.unwrap();
    assert_eq!(first.last_fetched_at, second.last_fetched_at);
}

// ============================================================================
// Search and watchlist over merged sources
// ============================================================================

#[tokio::test]
async fn test_sources_merge_into_one_index() {
    let server = MockServer::start().await;
    mount_feed(&server, "raw", ALERTS_URL, ALERTS_RSS).await;
    mount_feed(&server, "raw", ATOM_URL, ATOM_FEED).await;
    mount_failure(&server, "primary", 502).await;
    mount_failure(&server, "secondary", 502).await;

    let ingestor = ingestor(&server);
    ingestor
        .add_source(FeedSource::new("Alerts", ALERTS_URL))
        .unwrap();
    ingestor.add_source(FeedSource::new("Atom", ATOM_URL)).unwrap();

    let results = ingestor.load_all().await;
    assert!(results
        .iter()
        .all(|(_, state)| state.status == LoadStatus::Ready));

    // Both feeds carry the VPN link; only one entry is kept
    let index = ingestor.index();
    assert_eq!(index.len(), 3);

    let hits = index.query("RANSOMWARE");
    assert_eq!(hits.len(), 2);
    assert!(index.query("").is_empty());
}

#[tokio::test]
async fn test_watchlist_matches_and_persists() {
    let server = MockServer::start().await;
    mount_feed(&server, "raw", ALERTS_URL, ALERTS_RSS).await;
    mount_feed(&server, "raw", ATOM_URL, ATOM_FEED).await;
    mount_failure(&server, "primary", 500).await;
    mount_failure(&server, "secondary", 500).await;

    let ingestor = ingestor(&server);
    ingestor
        .add_source(FeedSource::new("Alerts", ALERTS_URL))
        .unwrap();
    ingestor.add_source(FeedSource::new("Atom", ATOM_URL)).unwrap();
    ingestor.load_all().await;

    let db = Database::open(":memory:").await.unwrap();
    let mut watchlist = Watchlist::load(Arc::clone(ingestor.index()), db.clone())
        .await
        .unwrap();
    assert_eq!(watchlist.add(" Ransomware").await.unwrap(), AddOutcome::Added);
    assert_eq!(watchlist.add("vpn").await.unwrap(), AddOutcome::Added);

    let counts: Vec<(String, usize)> = watchlist
        .entries()
        .into_iter()
        .map(|e| (e.keyword, e.count))
        .collect();
    assert_eq!(
        counts,
        vec![("ransomware".to_string(), 2), ("vpn".to_string(), 1)]
    );
    assert_eq!(watchlist.matches_all().len(), 3);

    let reloaded = Watchlist::load(Arc::clone(ingestor.index()), db)
        .await
        .unwrap();
    assert_eq!(
        reloaded.keywords(),
        &["ransomware".to_string(), "vpn".to_string()]
    );
}

#[tokio::test]
async fn test_rejected_source_is_never_fetched() {
    let server = MockServer::start().await;
    Mock::given(path("/raw"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ALERTS_RSS))
        .expect(0)
        .mount(&server)
        .await;

    let ingestor = ingestor(&server);
    assert!(ingestor
        .add_source(FeedSource::new("Internal", "http://10.0.0.5/rss"))
        .is_err());

    assert!(ingestor.sources().is_empty());
    assert!(ingestor.load_all().await.is_empty());
}
