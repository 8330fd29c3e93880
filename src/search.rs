//! In-memory, deduplicated index over every item the ingestor has seen.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use crate::feed::FeedItem;

/// One search hit, flattened for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    pub title: String,
    pub link: String,
    /// Publication date as the feed wrote it
    pub published: Option<String>,
    pub summary: Option<String>,
    /// Host of the originating feed
    pub source: String,
    pub link_safe: bool,
}

impl From<&FeedItem> for SearchResult {
    fn from(item: &FeedItem) -> Self {
        Self {
            title: item.title.clone(),
            link: item.link.clone(),
            published: item.published.as_ref().map(|p| p.raw.clone()),
            summary: item.summary.clone(),
            source: item.source_host.clone(),
            link_safe: item.link_safe,
        }
    }
}

#[derive(Default)]
struct IndexInner {
    items: Vec<FeedItem>,
    keys: HashSet<String>,
}

/// Accumulation of [`FeedItem`]s keyed by [`FeedItem::key`].
///
/// No two entries share a key; the first item merged for a key wins. Each
/// `merge` takes the write lock once, so concurrent merges of overlapping
/// batches still produce a single entry per key.
#[derive(Default)]
pub struct SearchIndex {
    inner: RwLock<IndexInner>,
}

impl SearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends every item whose key is not yet present. Returns how many
    /// were added.
    pub fn merge(&self, items: &[FeedItem]) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut added = 0;
        for item in items {
            if inner.keys.insert(item.key().to_string()) {
                inner.items.push(item.clone());
                added += 1;
            }
        }
        added
    }

    /// Case-insensitive substring search over title and summary, in
    /// insertion order. A blank term matches nothing.
    pub fn query(&self, term: &str) -> Vec<SearchResult> {
        self.scan(term, |item| SearchResult::from(item))
    }

    /// Same matching rule as [`query`](Self::query), returning whole items.
    pub fn matching(&self, term: &str) -> Vec<FeedItem> {
        self.scan(term, FeedItem::clone)
    }

    /// Number of items matching `term`, without cloning them.
    pub fn count_matching(&self, term: &str) -> usize {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() {
            return 0;
        }
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .items
            .iter()
            .filter(|item| item.matches_lowercase(&needle))
            .count()
    }

    /// Snapshot of every indexed item in insertion order.
    pub fn items(&self) -> Vec<FeedItem> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Session reset.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.items.clear();
        inner.keys.clear();
    }

    fn scan<T>(&self, term: &str, map: impl Fn(&FeedItem) -> T) -> Vec<T> {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .items
            .iter()
            .filter(|item| item.matches_lowercase(&needle))
            .map(map)
            .collect()
    }
}
