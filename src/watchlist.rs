//! Persistent keyword watchlist evaluated against the search index.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;

use crate::feed::FeedItem;
use crate::search::{SearchIndex, SearchResult};
use crate::storage::Database;

/// Storage key holding the keyword list as a JSON array of strings.
pub const WATCHLIST_KEY: &str = "watchlist.keywords";

#[derive(Debug, Error)]
pub enum WatchlistError {
    #[error("Keyword cannot be empty")]
    EmptyKeyword,
    #[error("Failed to persist watchlist: {0:#}")]
    Storage(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    AlreadyPresent,
}

/// A keyword with its match count against the current index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchlistEntry {
    pub keyword: String,
    pub count: usize,
}

/// An indexed item together with every keyword it matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchlistMatch {
    pub item: FeedItem,
    pub keywords: Vec<String>,
}

/// Set of normalized (trimmed, lowercased) keywords.
///
/// Counts are never stored; they are recomputed from the index on every
/// read. When a [`Database`] is attached, every mutation is written through
/// before it takes effect in memory.
pub struct Watchlist {
    keywords: Vec<String>,
    index: Arc<SearchIndex>,
    db: Option<Database>,
}

fn normalize(keyword: &str) -> String {
    keyword.trim().to_lowercase()
}

impl Watchlist {
    /// An empty, unpersisted watchlist.
    pub fn new(index: Arc<SearchIndex>) -> Self {
        Self {
            keywords: Vec::new(),
            index,
            db: None,
        }
    }

    /// Restores the keyword list from `db` and writes later changes back.
    ///
    /// A stored value that is not a JSON array of strings is logged and
    /// treated as an empty list.
    pub async fn load(index: Arc<SearchIndex>, db: Database) -> Result<Self, WatchlistError> {
        let stored = db
            .get_value(WATCHLIST_KEY)
            .await
            .map_err(WatchlistError::Storage)?;

        let mut keywords: Vec<String> = Vec::new();
        if let Some(raw) = stored {
            match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(values) => {
                    for value in values {
                        let keyword = normalize(&value);
                        if !keyword.is_empty() && !keywords.contains(&keyword) {
                            keywords.push(keyword);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(key = WATCHLIST_KEY, error = %e, "Corrupt watchlist in storage, starting empty");
                }
            }
        }

        tracing::debug!(keywords = keywords.len(), "Loaded watchlist");
        Ok(Self {
            keywords,
            index,
            db: Some(db),
        })
    }

    /// Keywords in insertion order.
    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub async fn add(&mut self, keyword: &str) -> Result<AddOutcome, WatchlistError> {
        let keyword = normalize(keyword);
        if keyword.is_empty() {
            return Err(WatchlistError::EmptyKeyword);
        }
        if self.keywords.contains(&keyword) {
            return Ok(AddOutcome::AlreadyPresent);
        }

        let mut next = self.keywords.clone();
        next.push(keyword);
        self.persist(&next).await?;
        self.keywords = next;
        Ok(AddOutcome::Added)
    }

    /// Removes a keyword. Returns false, without touching storage, when it
    /// was not present.
    pub async fn remove(&mut self, keyword: &str) -> Result<bool, WatchlistError> {
        let keyword = normalize(keyword);
        if !self.keywords.contains(&keyword) {
            return Ok(false);
        }

        let next: Vec<String> = self
            .keywords
            .iter()
            .filter(|k| **k != keyword)
            .cloned()
            .collect();
        self.persist(&next).await?;
        self.keywords = next;
        Ok(true)
    }

    /// Items matching one keyword, using the search rule.
    pub fn matches(&self, keyword: &str) -> Vec<SearchResult> {
        self.index.query(keyword)
    }

    /// Every keyword with its current match count.
    pub fn entries(&self) -> Vec<WatchlistEntry> {
        self.keywords
            .iter()
            .map(|keyword| WatchlistEntry {
                keyword: keyword.clone(),
                count: self.index.count_matching(keyword),
            })
            .collect()
    }

    /// Union of all keyword matches, one entry per item, in index order.
    pub fn matches_all(&self) -> Vec<WatchlistMatch> {
        if self.keywords.is_empty() {
            return Vec::new();
        }

        self.index
            .items()
            .into_iter()
            .filter_map(|item| {
                let keywords: Vec<String> = self
                    .keywords
                    .iter()
                    .filter(|k| item.matches_lowercase(k))
                    .cloned()
                    .collect();
                (!keywords.is_empty()).then_some(WatchlistMatch { item, keywords })
            })
            .collect()
    }

    /// [`matches_all`](Self::matches_all) restricted to items published
    /// within `window` of now. Items without a parseable date are excluded.
    ///
    /// A window reaching past the earliest representable time has no cutoff.
    pub fn matches_recent(&self, window: Duration) -> Vec<WatchlistMatch> {
        match Utc::now().checked_sub_signed(window) {
            Some(cutoff) => self.matches_since(cutoff),
            None => self.matches_all(),
        }
    }

    fn matches_since(&self, cutoff: DateTime<Utc>) -> Vec<WatchlistMatch> {
        self.matches_all()
            .into_iter()
            .filter(|m| m.item.published_at().is_some_and(|t| t >= cutoff))
            .collect()
    }

    async fn persist(&self, keywords: &[String]) -> Result<(), WatchlistError> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let value = serde_json::to_string(keywords)
            .map_err(|e| WatchlistError::Storage(anyhow::Error::new(e)))?;
        db.set_value(WATCHLIST_KEY, &value)
            .await
            .map_err(WatchlistError::Storage)
    }
}
