//! Feed ingestion: transport, parsing, per-source state and OPML.
//!
//! - [`transport`] - fetches a feed document through an ordered list of proxy
//!   backends, falling back on failure
//! - [`parser`] - turns RSS/Atom XML into sanitized [`FeedItem`]s
//! - [`ingestor`] - per-source fetch, parse and index with caching, retry and
//!   single-flight loads
//! - [`opml`] - import and export of feed sources
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use feedsentry::feed::{default_backends, FeedIngestor, FeedSource, Transport};
//! use feedsentry::search::SearchIndex;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let transport = Transport::new(reqwest::Client::new(), default_backends());
//! let ingestor = FeedIngestor::new(transport, Arc::new(SearchIndex::new()));
//! ingestor.add_source(FeedSource::new("Krebs", "https://krebsonsecurity.com/feed/"))?;
//!
//! let state = ingestor.load("https://krebsonsecurity.com/feed/").await?;
//! println!("{} items", state.items.len());
//! # Ok(())
//! # }
//! ```

pub mod ingestor;
pub mod opml;
pub mod parser;
pub mod transport;
mod types;

pub use ingestor::{
    FeedIngestor, FeedState, IngestError, LoadStatus, RetryPolicy, DEFAULT_MAX_CONCURRENT_SOURCES,
    DEFAULT_STALENESS,
};
pub use parser::{parse_feed, ParseError};
pub use transport::{
    build_client, default_backends, BackendError, ProxyBackend, ResponseShape, Transport,
    TransportError,
};
pub use types::{FeedItem, FeedSource, PublishedAt, RawItem};
