//! Query cache with optimistic mutations
//!
//! Every entry holds the last value fetched from the server and an ordered
//! list of optimistic layers. The visible value is the server value with the
//! layers applied in order. A failed mutation removes only its own layer and
//! recomputes, so layers stacked after it survive, and when nothing was
//! stacked after it the result is exactly the value it started from.
//! Confirmed layers stay until the next server value replaces them.

pub mod key;

pub use key::QueryKey;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::feed::{ChangeFeedBus, RowFilter, Subscription};
use crate::models::Table;
use crate::utils::{EngineError, Result};

pub type Updater<V> = Arc<dyn Fn(&V) -> V + Send + Sync>;

/// A cached value and whether it is due for a re-fetch
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<V> {
    pub value: V,
    pub stale: bool,
}

/// What views see through [`QueryCache::changes`]
#[derive(Debug, Clone, PartialEq)]
pub struct CacheView<V> {
    pub value: Option<V>,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerState {
    InFlight,
    Confirmed,
}

struct Layer<V> {
    id: Uuid,
    updater: Updater<V>,
    state: LayerState,
}

struct Entry<V> {
    server: Option<V>,
    fetched_at: Option<Instant>,
    invalidated: bool,
    layers: Vec<Layer<V>>,
    visible: Option<V>,
    tx: watch::Sender<CacheView<V>>,
    subscription: Option<Subscription>,
}

impl<V: Clone> Entry<V> {
    fn new() -> Self {
        let (tx, _) = watch::channel(CacheView {
            value: None,
            stale: true,
        });
        Self {
            server: None,
            fetched_at: None,
            invalidated: false,
            layers: Vec::new(),
            visible: None,
            tx,
            subscription: None,
        }
    }

    fn is_stale(&self, stale_after: Duration) -> bool {
        self.invalidated || self.fetched_at.map_or(true, |at| at.elapsed() >= stale_after)
    }

    fn recompute(&mut self) {
        let visible = self.server.as_ref().map(|server| {
            self.layers
                .iter()
                .fold(server.clone(), |value, layer| (layer.updater)(&value))
        });
        self.visible = visible;
    }

    fn publish(&self, stale_after: Duration) {
        self.tx.send_replace(CacheView {
            value: self.visible.clone(),
            stale: self.is_stale(stale_after),
        });
    }
}

struct CacheInner<V> {
    entries: Mutex<HashMap<QueryKey, Entry<V>>>,
    stale_after: Duration,
    feed: Option<ChangeFeedBus>,
}

impl<V: Clone> CacheInner<V> {
    fn lock(&self) -> MutexGuard<'_, HashMap<QueryKey, Entry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn invalidate(&self, key: &QueryKey) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.invalidated = true;
                entry.publish(self.stale_after);
                true
            }
            None => false,
        }
    }

    fn settle(&self, key: &QueryKey, id: Uuid, succeeded: bool) {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        if succeeded {
            if let Some(layer) = entry.layers.iter_mut().find(|layer| layer.id == id) {
                layer.state = LayerState::Confirmed;
            }
            return;
        }
        let before = entry.layers.len();
        entry.layers.retain(|layer| layer.id != id);
        if entry.layers.len() != before {
            entry.recompute();
            entry.publish(self.stale_after);
        }
    }
}

/// Settles an optimistic layer exactly once. Dropping it unsettled, for
/// example when the server call panics, rolls the layer back.
struct LayerGuard<V: Clone> {
    cache: Arc<CacheInner<V>>,
    key: QueryKey,
    id: Uuid,
    settled: bool,
}

impl<V: Clone> LayerGuard<V> {
    fn settle(&mut self, succeeded: bool) {
        self.settled = true;
        self.cache.settle(&self.key, self.id, succeeded);
    }
}

impl<V: Clone> Drop for LayerGuard<V> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(key = %self.key, "Mutation ended without a result, rolling back");
            self.cache.settle(&self.key, self.id, false);
        }
    }
}

/// Keyed cache shared by clones
pub struct QueryCache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for QueryCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> QueryCache<V> {
    pub fn new(stale_after: Duration) -> Self {
        Self::build(stale_after, None)
    }

    /// A cache whose [`watch`](Self::watch) binds entries to `feed`
    pub fn with_feed(feed: ChangeFeedBus, stale_after: Duration) -> Self {
        Self::build(stale_after, Some(feed))
    }

    fn build(stale_after: Duration, feed: Option<ChangeFeedBus>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                stale_after,
                feed,
            }),
        }
    }

    /// Current value with optimistic layers applied, possibly stale
    pub fn read(&self, key: &QueryKey) -> Option<Cached<V>> {
        let entries = self.inner.lock();
        let entry = entries.get(key)?;
        let value = entry.visible.clone()?;
        Some(Cached {
            value,
            stale: entry.is_stale(self.inner.stale_after),
        })
    }

    /// Store a fresh server value. Confirmed layers are dropped since the
    /// server value now reflects them; in-flight ones are re-applied.
    pub fn set(&self, key: &QueryKey, value: V) {
        let mut entries = self.inner.lock();
        let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
        entry.server = Some(value);
        entry.fetched_at = Some(Instant::now());
        entry.invalidated = false;
        entry.layers.retain(|layer| layer.state == LayerState::InFlight);
        entry.recompute();
        entry.publish(self.inner.stale_after);
    }

    /// Return the cached value if fresh, otherwise load and store it
    pub async fn fetch<F, Fut>(&self, key: &QueryKey, loader: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(cached) = self.read(key) {
            if !cached.stale {
                return Ok(cached.value);
            }
        }
        self.refresh(key, loader).await
    }

    /// Load and store regardless of freshness
    pub async fn refresh<F, Fut>(&self, key: &QueryKey, loader: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let value = loader().await?;
        self.set(key, value.clone());
        Ok(self.read(key).map_or(value, |cached| cached.value))
    }

    /// Mark an entry stale so the next `fetch` goes to the server
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        self.inner.invalidate(key)
    }

    /// Apply `updater` to the cached value now, then run `server_call`.
    ///
    /// The server call runs on its own task, so dropping the returned future
    /// does not leave the layer unresolved. On failure the layer is removed
    /// and the error comes back as `MutationFailure`.
    pub async fn mutate<T, U, F, Fut>(
        &self,
        key: &QueryKey,
        updater: U,
        server_call: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        U: Fn(&V) -> V + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        {
            let mut entries = self.inner.lock();
            let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
            entry.layers.push(Layer {
                id,
                updater: Arc::new(updater),
                state: LayerState::InFlight,
            });
            entry.recompute();
            entry.publish(self.inner.stale_after);
        }
        debug!(key = %key, mutation = %id, "Optimistic update applied");

        let mut guard = LayerGuard {
            cache: self.inner.clone(),
            key: key.clone(),
            id,
            settled: false,
        };
        let call = server_call();
        let handle = tokio::spawn(async move {
            let result = call.await;
            guard.settle(result.is_ok());
            result
        });

        let failure = match handle.await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(join_error) => {
                EngineError::InvalidData(format!("server call aborted: {}", join_error))
            }
        };
        warn!(key = %key, mutation = %id, "Mutation rolled back: {}", failure);
        Err(EngineError::MutationFailure {
            key: key.to_string(),
            source: Box::new(failure),
        })
    }

    /// Invalidate `key` whenever a matching row of `table` changes
    pub fn watch(&self, key: &QueryKey, table: Table, filter: Option<RowFilter>) -> Result<()> {
        let feed = self
            .inner
            .feed
            .as_ref()
            .ok_or_else(|| {
                EngineError::TransportUnavailable("cache has no change feed".to_string())
            })?;

        let cache = Arc::downgrade(&self.inner);
        let watched = key.clone();
        let subscription = feed.subscribe(table, filter, move |notice| {
            if let Some(cache) = cache.upgrade() {
                debug!(
                    key = %watched,
                    table = %notice.table,
                    kind = ?notice.kind,
                    "Cache entry stale"
                );
                cache.invalidate(&watched);
            }
        });

        // Replaced subscriptions are released outside the cache lock
        let replaced = {
            let mut entries = self.inner.lock();
            let entry = entries.entry(key.clone()).or_insert_with(Entry::new);
            entry.subscription.replace(subscription)
        };
        drop(replaced);
        Ok(())
    }

    /// Drop an entry and its feed subscription
    pub fn release(&self, key: &QueryKey) -> bool {
        let removed = self.inner.lock().remove(key);
        removed.is_some()
    }

    /// Receiver that sees every visible change of `key`
    pub fn changes(&self, key: &QueryKey) -> watch::Receiver<CacheView<V>> {
        let mut entries = self.inner.lock();
        entries
            .entry(key.clone())
            .or_insert_with(Entry::new)
            .tx
            .subscribe()
    }

    /// Optimistic layers not yet confirmed or rolled back
    pub fn in_flight(&self, key: &QueryKey) -> usize {
        self.inner.lock().get(key).map_or(0, |entry| {
            entry
                .layers
                .iter()
                .filter(|layer| layer.state == LayerState::InFlight)
                .count()
        })
    }
}
