//! Query cache — keyed server state with staleness, coalesced fetches, and
//! change notification.
//!
//! DESIGN
//! ======
//! Each [`CacheKey`] maps to an entry holding the last known value, when it
//! was fetched, its freshness window, and the fetcher that produced it.
//! Reads never block. `ensure_fresh` awaits a fetch only when the entry is
//! stale, and concurrent callers share one in-flight fetch through a
//! `Shared` future whose completion writes the result back itself. The fetch
//! is driven on the runtime, so a cancelled caller does not strand it.
//!
//! Invalidation marks matching entries stale. Entries that someone is
//! watching refetch in the background right away; unwatched ones wait for
//! their next read.
//!
//! OPTIMISTIC PATCHES
//! ==================
//! While the mutation coordinator holds a patch on a key, that entry's
//! speculative value is protected: anything that would replace or drop it
//! is recorded as deferred and applied once the patch resolves. The hooks are
//! crate-private; see `optimistic.rs`.
//!
//! LIFETIME
//! ========
//! A stale entry with no subscriber, no fetch in flight, and no pending patch
//! is evicted by `collect_garbage_at` once it has been idle for `gc_idle`.

mod key;

pub use key::{CacheKey, KeyParseError};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("fetch failed: {0}")]
    Failed(String),
    #[error("no fetcher registered for {0}")]
    NoFetcher(String),
}

pub type FetchFuture = BoxFuture<'static, Result<Value, FetchError>>;

/// Produces a fresh value for one key. Called once per fetch.
pub type Fetcher = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

/// Wrap an async closure as a [`Fetcher`].
pub fn fetcher<F, Fut>(f: F) -> Fetcher
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

type SharedFetch = Shared<FetchFuture>;

struct Entry {
    value: Option<Value>,
    fetched_at: Option<Instant>,
    stale_after: Option<Duration>,
    invalidated: bool,
    in_flight: Option<(u64, SharedFetch)>,
    fetcher: Option<Fetcher>,
    subscribers: usize,
    last_active: Instant,
    watch_tx: watch::Sender<Option<Value>>,
    patch_pending: bool,
    deferred_invalidation: bool,
    deferred_eviction: bool,
}

impl Entry {
    fn new(stale_after: Option<Duration>, now: Instant) -> Self {
        let (watch_tx, _) = watch::channel(None);
        Self {
            value: None,
            fetched_at: None,
            stale_after,
            invalidated: false,
            in_flight: None,
            fetcher: None,
            subscribers: 0,
            last_active: now,
            watch_tx,
            patch_pending: false,
            deferred_invalidation: false,
            deferred_eviction: false,
        }
    }

    fn is_stale_at(&self, now: Instant) -> bool {
        if self.invalidated {
            return true;
        }
        let Some(fetched_at) = self.fetched_at else {
            return true;
        };
        match self.stale_after {
            None => false,
            Some(window) => now.saturating_duration_since(fetched_at) >= window,
        }
    }

    fn set_value(&mut self, value: Option<Value>) {
        self.value.clone_from(&value);
        self.watch_tx.send_replace(value);
    }

    /// Drop the value but keep subscribers attached.
    fn reset(&mut self) {
        self.fetched_at = None;
        self.invalidated = false;
        self.in_flight = None;
        self.deferred_invalidation = false;
        self.deferred_eviction = false;
        self.set_value(None);
    }
}

/// What the coordinator saved before applying a patch.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EntrySnapshot {
    value: Option<Value>,
    fetched_at: Option<Instant>,
    invalidated: bool,
}

impl EntrySnapshot {
    /// Value before the patch, as the patch function sees it.
    pub(crate) fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }
}

/// How a pending patch ends.
pub(crate) enum Settle {
    /// Server accepted; store its authoritative value.
    Reconcile(Value),
    /// Server accepted a delete; drop the value.
    Evict,
    /// Server rejected or the mutation was abandoned; restore exactly.
    Revert(EntrySnapshot),
}

struct CacheState {
    entries: HashMap<CacheKey, Entry>,
    next_fetch_id: u64,
}

struct Inner {
    state: Mutex<CacheState>,
    default_stale_after: Option<Duration>,
    gc_idle: Duration,
}

// =============================================================================
// QUERY CACHE
// =============================================================================

/// Shared query cache. Cheap to clone.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl QueryCache {
    #[must_use]
    pub fn new(default_stale_after: Option<Duration>, gc_idle: Duration) -> Self {
        let inner = Inner {
            state: Mutex::new(CacheState { entries: HashMap::new(), next_fetch_id: 0 }),
            default_stale_after,
            gc_idle,
        };
        Self { inner: Arc::new(inner) }
    }

    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.default_stale_after, config.gc_idle)
    }

    /// Current value for `key`, without blocking. A stale entry with a known
    /// fetcher starts a background refetch; the caller still gets the old value.
    pub fn read(&self, key: &CacheKey) -> Option<Value> {
        let now = Instant::now();
        let (value, refetch) = {
            let mut state = self.lock();
            let Some(entry) = state.entries.get_mut(key) else {
                return None;
            };
            entry.last_active = now;
            let wants_refetch = entry.is_stale_at(now)
                && has_runtime()
                && entry.fetcher.is_some()
                && entry.in_flight.is_none()
                && !entry.patch_pending;
            let value = entry.value.clone();
            let refetch = if wants_refetch { self.start_fetch(&mut state, key).ok() } else { None };
            (value, refetch)
        };
        if let Some(shared) = refetch {
            spawn_fetch(key, shared);
        }
        value
    }

    /// Return a fresh value for `key`, fetching with `fetcher` if the entry is
    /// missing or stale. Uses the cache-wide default freshness window.
    ///
    /// # Errors
    ///
    /// Returns the fetcher's error. The previous value, if any, stays cached.
    pub async fn ensure_fresh(&self, key: &CacheKey, fetcher: Fetcher) -> Result<Value, FetchError> {
        self.ensure_fresh_with(key, self.inner.default_stale_after, fetcher).await
    }

    /// [`QueryCache::ensure_fresh`] with an explicit freshness window.
    /// `None` never goes stale on its own; `Some(Duration::ZERO)` always is.
    ///
    /// # Errors
    ///
    /// Returns the fetcher's error.
    pub async fn ensure_fresh_with(
        &self,
        key: &CacheKey,
        stale_after: Option<Duration>,
        fetcher: Fetcher,
    ) -> Result<Value, FetchError> {
        let shared = {
            let now = Instant::now();
            let mut state = self.lock();
            let entry = state
                .entries
                .entry(key.clone())
                .or_insert_with(|| Entry::new(stale_after, now));
            entry.stale_after = stale_after;
            entry.fetcher = Some(fetcher);
            entry.last_active = now;

            if let Some(value) = &entry.value
                && (entry.patch_pending || !entry.is_stale_at(now))
            {
                return Ok(value.clone());
            }
            let joining = entry.in_flight.is_some();
            let shared = self.start_fetch(&mut state, key)?;
            // Callers may be cancelled; the fetch itself runs to completion.
            if !joining {
                spawn_fetch(key, shared.clone());
            }
            shared
        };
        shared.await
    }

    /// Mark every entry matched by `pattern` stale. Watched entries refetch
    /// now; the rest on their next read. Returns the number of entries hit.
    pub fn invalidate(&self, pattern: &CacheKey) -> usize {
        let mut refetches = Vec::new();
        let hit = {
            let mut state = self.lock();
            let mut hit = 0;
            let mut watched = Vec::new();
            for (key, entry) in state.entries.iter_mut().filter(|(key, _)| pattern.matches(key)) {
                hit += 1;
                if entry.patch_pending {
                    entry.deferred_invalidation = true;
                    debug!(%key, "cache: invalidation deferred behind pending patch");
                    continue;
                }
                entry.invalidated = true;
                // A fetch started before the change may carry pre-change data.
                entry.in_flight = None;
                if entry.subscribers > 0 && entry.fetcher.is_some() && has_runtime() {
                    watched.push(key.clone());
                }
            }
            for key in watched {
                if let Ok(shared) = self.start_fetch(&mut state, &key) {
                    refetches.push((key, shared));
                }
            }
            hit
        };
        for (key, shared) in refetches {
            spawn_fetch(&key, shared);
        }
        if hit > 0 {
            debug!(%pattern, hit, "cache: invalidated");
        }
        hit
    }

    /// Store an authoritative value for `key`, e.g. from a server push.
    /// Any in-flight fetch for the key is superseded.
    pub fn write(&self, key: &CacheKey, value: Value) {
        let now = Instant::now();
        let deferred = {
            let mut state = self.lock();
            let default = self.inner.default_stale_after;
            let entry = state.entries.entry(key.clone()).or_insert_with(|| Entry::new(default, now));
            if entry.patch_pending {
                entry.deferred_invalidation = true;
                true
            } else {
                entry.fetched_at = Some(now);
                entry.invalidated = false;
                entry.in_flight = None;
                entry.last_active = now;
                entry.set_value(Some(value));
                false
            }
        };
        if deferred {
            debug!(%key, "cache: write deferred behind pending patch");
        }
    }

    /// Evict `key`. Subscribers stay attached and observe `None`.
    /// With a patch pending, the eviction waits until the patch settles.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            return false;
        };
        if entry.patch_pending {
            entry.deferred_eviction = true;
            debug!(%key, "cache: removal deferred behind pending patch");
            return true;
        }
        evict(&mut state, key);
        debug!(%key, "cache: removed");
        true
    }

    /// Drop every value. Used on logout.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.retain(|_, entry| {
            if entry.subscribers > 0 {
                entry.reset();
                entry.fetcher = None;
                true
            } else {
                false
            }
        });
        info!("cache: cleared");
    }

    /// Watch `key`. While at least one subscription lives, invalidation
    /// refetches the entry eagerly and GC leaves it alone.
    #[must_use]
    pub fn subscribe(&self, key: &CacheKey) -> CacheSubscription {
        let now = Instant::now();
        let mut state = self.lock();
        let default = self.inner.default_stale_after;
        let entry = state.entries.entry(key.clone()).or_insert_with(|| Entry::new(default, now));
        entry.subscribers += 1;
        entry.last_active = now;
        CacheSubscription {
            key: key.clone(),
            rx: entry.watch_tx.subscribe(),
            cache: Arc::downgrade(&self.inner),
        }
    }

    /// [`QueryCache::subscribe`] that also registers `fetcher` and loads the
    /// entry in the background if it is missing or stale.
    #[must_use]
    pub fn subscribe_with(&self, key: &CacheKey, fetcher: Fetcher) -> CacheSubscription {
        let subscription = self.subscribe(key);
        let refetch = {
            let mut state = self.lock();
            let now = Instant::now();
            let wanted = match state.entries.get_mut(key) {
                Some(entry) => {
                    entry.fetcher = Some(fetcher);
                    entry.is_stale_at(now)
                        && entry.in_flight.is_none()
                        && !entry.patch_pending
                        && has_runtime()
                }
                None => false,
            };
            if wanted { self.start_fetch(&mut state, key).ok() } else { None }
        };
        if let Some(shared) = refetch {
            spawn_fetch(key, shared);
        }
        subscription
    }

    /// Evict idle, stale, unobserved entries as of `now`. Returns the number evicted.
    pub fn collect_garbage_at(&self, now: Instant) -> usize {
        let idle = self.inner.gc_idle;
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| {
            entry.subscribers > 0
                || entry.in_flight.is_some()
                || entry.patch_pending
                || !entry.is_stale_at(now)
                || now.saturating_duration_since(entry.last_active) < idle
        });
        let evicted = before - state.entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = state.entries.len(), "cache: gc");
        }
        evicted
    }

    /// Run `collect_garbage_at` every `interval` until the cache is dropped.
    pub fn spawn_gc_task(&self, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                QueryCache { inner }.collect_garbage_at(Instant::now());
            }
        })
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn is_stale(&self, key: &CacheKey) -> bool {
        self.lock().entries.get(key).is_none_or(|entry| entry.is_stale_at(Instant::now()))
    }

    #[must_use]
    pub fn is_fetching(&self, key: &CacheKey) -> bool {
        self.lock().entries.get(key).is_some_and(|entry| entry.in_flight.is_some())
    }

    #[must_use]
    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.lock().entries.get(key).map_or(0, |entry| entry.subscribers)
    }

    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -------------------------------------------------------------------------
    // Patch hooks (mutation coordinator only)
    // -------------------------------------------------------------------------

    /// Snapshot `key` and mark a patch pending. Creates the entry if needed.
    pub(crate) fn begin_patch(&self, key: &CacheKey) -> EntrySnapshot {
        let now = Instant::now();
        let mut state = self.lock();
        let default = self.inner.default_stale_after;
        let entry = state.entries.entry(key.clone()).or_insert_with(|| Entry::new(default, now));
        entry.patch_pending = true;
        entry.last_active = now;
        EntrySnapshot {
            value: entry.value.clone(),
            fetched_at: entry.fetched_at,
            invalidated: entry.invalidated,
        }
    }

    /// Publish the speculative value for a pending patch.
    pub(crate) fn apply_speculative(&self, key: &CacheKey, value: Value) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.set_value(Some(value));
        }
    }

    /// End the pending patch on `key`, then apply any removal or
    /// invalidation that arrived meanwhile. A removal wins.
    pub(crate) fn settle_patch(&self, key: &CacheKey, outcome: Settle) {
        let now = Instant::now();
        let deferred = {
            let mut state = self.lock();
            let Some(entry) = state.entries.get_mut(key) else {
                return;
            };
            match outcome {
                Settle::Reconcile(value) => {
                    entry.fetched_at = Some(now);
                    entry.invalidated = false;
                    entry.set_value(Some(value));
                }
                Settle::Evict => {
                    entry.fetched_at = None;
                    entry.invalidated = false;
                    entry.set_value(None);
                }
                Settle::Revert(snapshot) => {
                    entry.fetched_at = snapshot.fetched_at;
                    entry.invalidated = snapshot.invalidated;
                    entry.set_value(snapshot.value);
                }
            }
            entry.patch_pending = false;
            entry.last_active = now;
            if std::mem::take(&mut entry.deferred_eviction) {
                evict(&mut state, key);
                debug!(%key, "cache: applied deferred removal");
                return;
            }
            std::mem::take(&mut entry.deferred_invalidation)
        };
        if deferred {
            debug!(%key, "cache: applying deferred invalidation");
            self.invalidate(key);
        }
    }

    // -------------------------------------------------------------------------
    // Fetch plumbing
    // -------------------------------------------------------------------------

    /// Join the in-flight fetch for `key`, or start one. Caller holds the lock.
    fn start_fetch(&self, state: &mut CacheState, key: &CacheKey) -> Result<SharedFetch, FetchError> {
        state.next_fetch_id += 1;
        let fetch_id = state.next_fetch_id;
        let Some(entry) = state.entries.get_mut(key) else {
            return Err(FetchError::NoFetcher(key.to_string()));
        };
        if let Some((_, shared)) = &entry.in_flight {
            return Ok(shared.clone());
        }
        let Some(fetch) = entry.fetcher.clone() else {
            return Err(FetchError::NoFetcher(key.to_string()));
        };

        let weak = Arc::downgrade(&self.inner);
        let owned_key = key.clone();
        let shared = async move {
            let result = fetch().await;
            if let Some(inner) = weak.upgrade() {
                complete_fetch(&inner, &owned_key, fetch_id, &result);
            }
            result
        }
        .boxed()
        .shared();

        entry.in_flight = Some((fetch_id, shared.clone()));
        debug!(%key, fetch_id, "cache: fetch started");
        Ok(shared)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        lock_state(&self.inner)
    }
}

/// Drop the entry, or just its value while someone still watches it.
fn evict(state: &mut CacheState, key: &CacheKey) {
    match state.entries.get_mut(key) {
        Some(entry) if entry.subscribers > 0 => entry.reset(),
        Some(_) => {
            state.entries.remove(key);
        }
        None => {}
    }
}

fn lock_state(inner: &Inner) -> MutexGuard<'_, CacheState> {
    inner.state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Store a finished fetch, unless it was superseded by a write,
/// invalidation, or removal while in flight.
fn complete_fetch(inner: &Inner, key: &CacheKey, fetch_id: u64, result: &Result<Value, FetchError>) {
    let mut state = lock_state(inner);
    let Some(entry) = state.entries.get_mut(key) else {
        return;
    };
    if !matches!(&entry.in_flight, Some((id, _)) if *id == fetch_id) {
        debug!(%key, fetch_id, "cache: discarding superseded fetch");
        return;
    }
    entry.in_flight = None;

    match result {
        Ok(_) if entry.patch_pending => entry.deferred_invalidation = true,
        Ok(value) => {
            entry.fetched_at = Some(Instant::now());
            entry.invalidated = false;
            entry.set_value(Some(value.clone()));
        }
        Err(e) => warn!(%key, error = %e, "cache: fetch failed; keeping previous value"),
    }
}

/// Background refetches need a runtime. Without one an invalidated entry
/// simply stays stale until the next `ensure_fresh`.
fn has_runtime() -> bool {
    tokio::runtime::Handle::try_current().is_ok()
}

fn spawn_fetch(key: &CacheKey, shared: SharedFetch) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                let _ = shared.await;
            });
        }
        Err(_) => debug!(%key, "cache: no runtime; refetch waits for next read"),
    }
}

// =============================================================================
// SUBSCRIPTION
// =============================================================================

/// Live view of one cache entry. Dropping it releases the interest.
pub struct CacheSubscription {
    key: CacheKey,
    rx: watch::Receiver<Option<Value>>,
    cache: Weak<Inner>,
}

impl CacheSubscription {
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Latest value as of now.
    #[must_use]
    pub fn current(&self) -> Option<Value> {
        self.rx.borrow().clone()
    }

    /// Wait for the next change. Returns `false` once the entry is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

impl Drop for CacheSubscription {
    fn drop(&mut self) {
        let Some(inner) = self.cache.upgrade() else {
            return;
        };
        let mut state = lock_state(&inner);
        if let Some(entry) = state.entries.get_mut(&self.key) {
            entry.subscribers = entry.subscribers.saturating_sub(1);
            entry.last_active = Instant::now();
        }
    }
}

impl std::fmt::Debug for CacheSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSubscription").field("key", &self.key).finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
