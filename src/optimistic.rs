//! Optimistic mutation coordinator — speculative patch, then reconcile or revert.
//!
//! DESIGN
//! ======
//! `mutate` runs one user-initiated write against one cache key:
//!
//! 1. wait for this key's turn (per-key FIFO; other keys run in parallel)
//! 2. snapshot the entry and mark a patch pending
//! 3. apply the patch synchronously, before any I/O
//! 4. await the caller's submit future
//! 5. success: store the authoritative value (or evict on delete), then run
//!    the cascade for the change, skipping the key just written
//! 6. failure: restore the snapshot exactly and return the error
//!
//! The pending-patch record lives in a guard. Settling consumes it, and
//! dropping an unsettled guard reverts, so a mutation future dropped
//! mid-flight still rolls back and the record is removed exactly once.
//!
//! Invalidations that arrive for the key while its patch is pending are held
//! by the cache and applied after the patch settles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use frames::Frame;
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, EntrySnapshot, QueryCache, Settle};
use crate::cascade::{ChangeOp, EntityChange};
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutationError {
    #[error("server rejected mutation: {message}")]
    Rejected { code: Option<String>, message: String },
    #[error(transparent)]
    Transport(TransportError),
    #[error("mutation cancelled")]
    Cancelled,
}

impl From<TransportError> for MutationError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Rejected { code, message, .. } => Self::Rejected { code, message },
            TransportError::Cancelled => Self::Cancelled,
            other => Self::Transport(other),
        }
    }
}

/// What is being mutated: the cache key to patch, and the entity change
/// whose cascade runs on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub key: CacheKey,
    pub change: Option<EntityChange>,
}

impl Mutation {
    #[must_use]
    pub fn new(key: CacheKey) -> Self {
        Self { key, change: None }
    }

    /// Mutation of an entity's own detail entry.
    #[must_use]
    pub fn of(change: EntityChange) -> Self {
        Self { key: change.kind.detail(&change.id), change: Some(change) }
    }

    #[must_use]
    pub fn with_change(mut self, change: EntityChange) -> Self {
        self.change = Some(change);
        self
    }

    fn is_delete(&self) -> bool {
        self.change.as_ref().is_some_and(|c| c.op == ChangeOp::Delete)
    }
}

type KeyLocks = Arc<Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>>;

#[derive(Clone)]
pub struct MutationCoordinator {
    cache: QueryCache,
    locks: KeyLocks,
    pending: Arc<AtomicUsize>,
}

impl MutationCoordinator {
    #[must_use]
    pub fn new(cache: QueryCache) -> Self {
        Self { cache, locks: Arc::default(), pending: Arc::default() }
    }

    /// Apply `patch` to `mutation.key` now, then settle with `submit`'s outcome.
    /// `patch` receives the current value (or `None`) and returns the
    /// speculative one. Returns the authoritative value on success.
    ///
    /// # Errors
    ///
    /// Returns the submit error after the snapshot has been restored.
    pub async fn mutate<P, S, Fut>(
        &self,
        mutation: Mutation,
        patch: P,
        submit: S,
    ) -> Result<Value, MutationError>
    where
        P: FnOnce(Option<&Value>) -> Value,
        S: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, MutationError>>,
    {
        let key = mutation.key.clone();
        let _turn = self.turn(&key).await;

        let snapshot = self.cache.begin_patch(&key);
        let guard = PatchGuard::new(self.cache.clone(), key.clone(), snapshot, &self.pending);
        let speculative = patch(guard.base());
        self.cache.apply_speculative(&key, speculative);
        debug!(%key, "optimistic: patch applied");

        match submit().await {
            Ok(authoritative) => {
                if mutation.is_delete() {
                    guard.settle(Settle::Evict);
                } else {
                    guard.settle(Settle::Reconcile(authoritative.clone()));
                }
                if let Some(change) = &mutation.change {
                    self.run_cascade(&key, change);
                }
                info!(%key, "optimistic: reconciled");
                Ok(authoritative)
            }
            Err(e) => {
                guard.revert();
                warn!(%key, error = %e, "optimistic: reverted");
                Err(e)
            }
        }
    }

    /// Patches currently awaiting their submit outcome.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn run_cascade(&self, written: &CacheKey, change: &EntityChange) {
        for key in change.cascade() {
            if &key != written {
                self.cache.invalidate(&key);
            }
        }
    }

    /// Wait until every earlier mutation on `key` has settled.
    async fn turn(&self, key: &CacheKey) -> KeyTurn {
        let lock = {
            let mut locks = lock(&self.locks);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let guard = lock.lock_owned().await;
        KeyTurn { guard: Some(guard), locks: Arc::clone(&self.locks), key: key.clone() }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shallow JSON merge: `fields` overwrite the current object's fields.
/// A missing or non-object current value is replaced by `fields`.
pub fn merge_patch(fields: Value) -> impl FnOnce(Option<&Value>) -> Value {
    move |current: Option<&Value>| match (current, fields) {
        (Some(Value::Object(base)), Value::Object(fields)) => {
            let mut merged = base.clone();
            merged.extend(fields);
            Value::Object(merged)
        }
        (_, fields) => fields,
    }
}

/// Submit `frame` over the realtime transport and return the reply payload.
///
/// # Errors
///
/// Maps an error reply to [`MutationError::Rejected`] and everything else to
/// [`MutationError::Transport`].
pub async fn submit_frame(
    transport: &Transport,
    frame: Frame,
    timeout: Duration,
) -> Result<Value, MutationError> {
    let reply = transport.request(frame, timeout).await?;
    Ok(reply.data)
}

// =============================================================================
// GUARDS
// =============================================================================

/// The pending-patch record for one key.
struct PatchGuard {
    cache: QueryCache,
    key: CacheKey,
    snapshot: Option<EntrySnapshot>,
    pending: Arc<AtomicUsize>,
}

impl PatchGuard {
    fn new(
        cache: QueryCache,
        key: CacheKey,
        snapshot: EntrySnapshot,
        pending: &Arc<AtomicUsize>,
    ) -> Self {
        pending.fetch_add(1, Ordering::AcqRel);
        Self { cache, key, snapshot: Some(snapshot), pending: Arc::clone(pending) }
    }

    fn base(&self) -> Option<&Value> {
        self.snapshot.as_ref().and_then(EntrySnapshot::value)
    }

    fn settle(mut self, outcome: Settle) {
        if self.snapshot.take().is_some() {
            self.finish(outcome);
        }
    }

    fn revert(mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.finish(Settle::Revert(snapshot));
        }
    }

    fn finish(&self, outcome: Settle) {
        self.cache.settle_patch(&self.key, outcome);
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for PatchGuard {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            warn!(key = %self.key, "optimistic: mutation dropped mid-flight; reverting");
            self.finish(Settle::Revert(snapshot));
        }
    }
}

/// Exclusive turn on one key. Removes the key's lock once nobody waits on it.
struct KeyTurn {
    guard: Option<OwnedMutexGuard<()>>,
    locks: KeyLocks,
    key: CacheKey,
}

impl Drop for KeyTurn {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = lock(&self.locks);
        if let Some(entry) = locks.get(&self.key)
            && Arc::strong_count(entry) == 1
        {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
#[path = "optimistic_test.rs"]
mod tests;
