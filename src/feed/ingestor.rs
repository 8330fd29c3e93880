use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use super::parser::{parse_feed, ParseError};
use super::transport::{Transport, TransportError};
use super::types::{FeedItem, FeedSource};
use crate::search::SearchIndex;
use crate::util::{validate_feed_url, ValidationError};

/// Cached results younger than this are served without a network call.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(5 * 60);
/// Sources loaded at once by [`FeedIngestor::load_all`].
pub const DEFAULT_MAX_CONCURRENT_SOURCES: usize = 6;

/// Bounded retry with capped exponential backoff around one whole
/// fetch + parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failed_attempt`-th failure (1-based):
    /// `base_delay * 2^(failed_attempt - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let factor = 2u32
            .checked_pow(failed_attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Where a source is in its load cycle.
///
/// `Idle → Loading → Ready | Errored`; both `Ready` (after staleness expiry)
/// and `Errored` may go back to `Loading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Idle,
    Loading,
    Ready,
    Errored,
}

/// Snapshot of one source's runtime state.
#[derive(Debug, Clone)]
pub struct FeedState {
    pub status: LoadStatus,
    /// Items from the last successful load, kept through later failures
    pub items: Arc<Vec<FeedItem>>,
    pub last_error: Option<String>,
    pub last_fetched_at: Option<DateTime<Utc>>,
}

impl FeedState {
    fn idle() -> Self {
        Self {
            status: LoadStatus::Idle,
            items: Arc::new(Vec::new()),
            last_error: None,
            last_fetched_at: None,
        }
    }

    pub fn loading(&self) -> bool {
        self.status == LoadStatus::Loading
    }

    pub fn error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

/// Errors produced while loading a source.
///
/// Transport and parse failures never escape [`FeedIngestor::load`]; they are
/// recorded as the source's `last_error`.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Unknown feed source: {0}")]
    UnknownSource(String),
}

type SharedLoad = Shared<BoxFuture<'static, FeedState>>;

struct SlotInner {
    state: FeedState,
    fetched_at: Option<Instant>,
    in_flight: Option<SharedLoad>,
}

impl SlotInner {
    fn is_fresh(&self, staleness: Duration) -> bool {
        self.state.status == LoadStatus::Ready
            && self.fetched_at.is_some_and(|t| t.elapsed() < staleness)
    }
}

struct SourceSlot {
    source: FeedSource,
    inner: Mutex<SlotInner>,
    tx: watch::Sender<FeedState>,
}

impl SourceSlot {
    fn new(source: FeedSource) -> Self {
        let (tx, _rx) = watch::channel(FeedState::idle());
        Self {
            source,
            inner: Mutex::new(SlotInner {
                state: FeedState::idle(),
                fetched_at: None,
                in_flight: None,
            }),
            tx,
        }
    }

    /// Stores `state` and notifies subscribers. Caller holds the slot lock.
    fn publish(&self, inner: &mut SlotInner, state: FeedState) {
        inner.state = state;
        self.tx.send_replace(inner.state.clone());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-source fetch → parse → index pipeline with caching, retry and
/// single-flight loads.
///
/// Each registered [`FeedSource`] owns one [`FeedState`]. Loads for different
/// sources run concurrently; loads for the same source never overlap. A load
/// requested while one is in flight joins it instead of fetching again. The
/// pipeline runs in a spawned task, so dropping a `load` future only stops the
/// caller from seeing the result.
pub struct FeedIngestor {
    transport: Transport,
    index: Arc<SearchIndex>,
    retry: RetryPolicy,
    staleness: Duration,
    max_concurrent: usize,
    slots: Mutex<Vec<Arc<SourceSlot>>>,
}

impl FeedIngestor {
    pub fn new(transport: Transport, index: Arc<SearchIndex>) -> Self {
        Self {
            transport,
            index,
            retry: RetryPolicy::default(),
            staleness: DEFAULT_STALENESS,
            max_concurrent: DEFAULT_MAX_CONCURRENT_SOURCES,
            slots: Mutex::new(Vec::new()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn index(&self) -> &Arc<SearchIndex> {
        &self.index
    }

    /// Registers a source after validating its URL.
    ///
    /// A source that fails validation is never registered and so never
    /// fetched. Registering a URL that is already present is a no-op.
    /// Surrounding whitespace is dropped from the stored URL.
    pub fn add_source(&self, mut source: FeedSource) -> Result<(), ValidationError> {
        if let Err(e) = validate_feed_url(&source.url) {
            tracing::warn!(feed = %source.url, title = %source.title, error = %e, "Rejected feed source");
            return Err(e);
        }
        let trimmed = source.url.trim();
        if trimmed.len() != source.url.len() {
            source.url = trimmed.to_string();
        }

        let mut slots = lock(&self.slots);
        if slots.iter().any(|s| s.source.url == source.url) {
            tracing::debug!(feed = %source.url, "Feed source already registered");
            return Ok(());
        }

        tracing::debug!(feed = %source.url, title = %source.title, "Registered feed source");
        slots.push(Arc::new(SourceSlot::new(source)));
        Ok(())
    }

    /// Drops a source and its state. Returns false if it was not registered.
    ///
    /// Items already merged into the search index stay there.
    pub fn remove_source(&self, url: &str) -> bool {
        let mut slots = lock(&self.slots);
        let before = slots.len();
        let url = url.trim();
        slots.retain(|s| s.source.url != url);
        before != slots.len()
    }

    /// Registered sources in registration order.
    pub fn sources(&self) -> Vec<FeedSource> {
        lock(&self.slots)
            .iter()
            .map(|s| s.source.clone())
            .collect()
    }

    /// Current state of a source without triggering a load.
    pub fn state(&self, url: &str) -> Option<FeedState> {
        self.slot(url).map(|slot| lock(&slot.inner).state.clone())
    }

    /// Observes every state transition of a source.
    ///
    /// Dropping the receiver is how a consumer cancels interest.
    pub fn subscribe(&self, url: &str) -> Option<watch::Receiver<FeedState>> {
        self.slot(url).map(|slot| slot.tx.subscribe())
    }

    /// Loads a source, serving the cached state while it is fresh.
    ///
    /// # Errors
    ///
    /// Only [`IngestError::UnknownSource`]. Fetch and parse failures are
    /// reported through the returned state's `last_error`.
    pub async fn load(&self, url: &str) -> Result<FeedState, IngestError> {
        let slot = self
            .slot(url)
            .ok_or_else(|| IngestError::UnknownSource(url.to_string()))?;
        Ok(self.load_slot(&slot, false).await)
    }

    /// Loads a source now, ignoring the staleness window.
    ///
    /// Joins a load that is already in flight rather than starting another.
    pub async fn retry(&self, url: &str) -> Result<FeedState, IngestError> {
        let slot = self
            .slot(url)
            .ok_or_else(|| IngestError::UnknownSource(url.to_string()))?;
        Ok(self.load_slot(&slot, true).await)
    }

    /// Loads every registered source concurrently.
    ///
    /// Results are returned in completion order, not registration order.
    pub async fn load_all(&self) -> Vec<(FeedSource, FeedState)> {
        let slots: Vec<Arc<SourceSlot>> = lock(&self.slots).clone();

        stream::iter(slots)
            .map(|slot| async move {
                let state = self.load_slot(&slot, false).await;
                (slot.source.clone(), state)
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await
    }

    fn slot(&self, url: &str) -> Option<Arc<SourceSlot>> {
        let url = url.trim();
        lock(&self.slots)
            .iter()
            .find(|s| s.source.url == url)
            .cloned()
    }

    async fn load_slot(&self, slot: &Arc<SourceSlot>, force: bool) -> FeedState {
        let pending = {
            let mut inner = lock(&slot.inner);

            if let Some(pending) = &inner.in_flight {
                tracing::debug!(feed = %slot.source.url, "Joining in-flight load");
                pending.clone()
            } else if !force && inner.is_fresh(self.staleness) {
                tracing::debug!(feed = %slot.source.url, "Serving cached feed state");
                return inner.state.clone();
            } else {
                let mut loading = inner.state.clone();
                loading.status = LoadStatus::Loading;
                slot.publish(&mut inner, loading);

                let pending = self.spawn_pipeline(Arc::clone(slot));
                inner.in_flight = Some(pending.clone());
                pending
            }
        };

        pending.await
    }

    fn spawn_pipeline(&self, slot: Arc<SourceSlot>) -> SharedLoad {
        let task = tokio::spawn(run_pipeline(
            Arc::clone(&slot),
            self.transport.clone(),
            Arc::clone(&self.index),
            self.retry,
        ));

        async move {
            match task.await {
                Ok(state) => state,
                Err(e) => {
                    tracing::error!(feed = %slot.source.url, error = %e, "Feed load task failed");
                    let mut inner = lock(&slot.inner);
                    let mut failed = inner.state.clone();
                    failed.status = LoadStatus::Errored;
                    failed.last_error = Some(format!("Load task failed: {}", e));
                    slot.publish(&mut inner, failed);
                    inner.in_flight = None;
                    inner.state.clone()
                }
            }
        }
        .boxed()
        .shared()
    }
}

async fn run_pipeline(
    slot: Arc<SourceSlot>,
    transport: Transport,
    index: Arc<SearchIndex>,
    retry: RetryPolicy,
) -> FeedState {
    let url = slot.source.url.as_str();
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;

    let outcome = loop {
        match fetch_and_parse(&transport, url).await {
            Ok(items) => break Ok(items),
            Err(e) if attempt < max_attempts => {
                let delay = retry.delay_for(attempt);
                tracing::warn!(
                    feed = %url,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Feed load failed, retrying after delay"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => break Err(e),
        }
    };

    let added = match &outcome {
        Ok(items) => index.merge(items),
        Err(_) => 0,
    };

    let mut inner = lock(&slot.inner);
    let next = match outcome {
        Ok(items) => {
            tracing::info!(
                feed = %url,
                items = items.len(),
                indexed = added,
                "Feed loaded"
            );
            inner.fetched_at = Some(Instant::now());
            FeedState {
                status: LoadStatus::Ready,
                items: Arc::new(items),
                last_error: None,
                last_fetched_at: Some(Utc::now()),
            }
        }
        Err(e) => {
            tracing::warn!(
                feed = %url,
                attempts = max_attempts,
                kept_items = inner.state.items.len(),
                error = %e,
                "Feed load failed"
            );
            FeedState {
                status: LoadStatus::Errored,
                last_error: Some(e.to_string()),
                ..inner.state.clone()
            }
        }
    };

    slot.publish(&mut inner, next);
    inner.in_flight = None;
    inner.state.clone()
}

async fn fetch_and_parse(transport: &Transport, url: &str) -> Result<Vec<FeedItem>, IngestError> {
    let raw = transport.fetch_raw(url).await?;
    let items = parse_feed(&raw, url)?;

    let blocked = items.iter().filter(|i| !i.link_safe).count();
    if blocked > 0 {
        tracing::debug!(feed = %url, blocked = blocked, "Items with unsafe links neutralized");
    }

    Ok(items)
}
