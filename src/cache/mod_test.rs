use super::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn cache() -> QueryCache {
    QueryCache::new(None, Duration::from_secs(300))
}

/// Fetcher returning `{"n": <call number>}` and counting calls.
fn counting(calls: &Arc<AtomicUsize>) -> Fetcher {
    let calls = Arc::clone(calls);
    fetcher(move || {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Ok(json!({ "n": n })) }
    })
}

/// Fetcher that blocks until `gate` is notified.
fn gated(calls: &Arc<AtomicUsize>, gate: &Arc<Notify>) -> Fetcher {
    let calls = Arc::clone(calls);
    let gate = Arc::clone(gate);
    fetcher(move || {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        let gate = Arc::clone(&gate);
        async move {
            gate.notified().await;
            Ok(json!({ "n": n }))
        }
    })
}

fn failing() -> Fetcher {
    fetcher(|| async { Err(FetchError::Failed("503".into())) })
}

// =============================================================================
// KEYS
// =============================================================================

#[test]
fn key_text_form_is_canonical() {
    let a = CacheKey::list("tasks").with("status", "open").with("project_id", 7);
    let b = CacheKey::list("tasks").with("project_id", 7).with("status", "open");
    assert_eq!(a, b);
    assert_eq!(a.to_string(), "tasks?project_id=7&status=open");
    assert_eq!(CacheKey::detail("task", 42).to_string(), "task:42");
}

#[test]
fn key_parses_back_from_text() {
    let key: CacheKey = "tasks?status=open&project_id=7".parse().unwrap();
    assert_eq!(key, CacheKey::list("tasks").with("project_id", 7).with("status", "open"));

    let odd = CacheKey::detail("comment", "a:b").with("q", "x&y=z");
    assert_eq!(odd.to_string().parse::<CacheKey>().unwrap(), odd);
}

#[test]
fn key_kind_with_structural_characters_survives_text_form() {
    let key = CacheKey::detail("a:b?c", 1).with("x", "y");
    let text = key.to_string();
    assert_eq!(text, "a%3Ab%3Fc:1?x=y");
    assert_eq!(text.parse::<CacheKey>().unwrap(), key);

    let list = CacheKey::list("tasks:archived");
    assert_eq!(list.to_string().parse::<CacheKey>().unwrap(), list);
}

#[test]
fn key_parse_rejects_malformed_text() {
    assert_eq!("".parse::<CacheKey>(), Err(KeyParseError::Empty));
    assert!(matches!(":42".parse::<CacheKey>(), Err(KeyParseError::EmptyKind(_))));
    assert!(matches!("tasks?status".parse::<CacheKey>(), Err(KeyParseError::BadParam(_))));
}

#[test]
fn pattern_matching_covers_filtered_variants() {
    let all_tasks = CacheKey::list("tasks");
    let open = CacheKey::list("tasks").with("status", "open");
    let open_p7 = CacheKey::list("tasks").with("status", "open").with("project_id", 7);

    assert!(all_tasks.matches(&open));
    assert!(all_tasks.matches(&open_p7));
    assert!(open.matches(&open_p7));
    assert!(!open_p7.matches(&open));
    assert!(!all_tasks.matches(&CacheKey::list("projects")));

    let detail = CacheKey::detail("task", 42);
    assert!(detail.matches(&CacheKey::detail("task", 42).with("include", "comments")));
    assert!(!detail.matches(&CacheKey::detail("task", 43)));
    assert!(CacheKey::list("task").matches(&detail));
}

// =============================================================================
// FRESHNESS AND COALESCING
// =============================================================================

#[tokio::test]
async fn ensure_fresh_fetches_once_then_serves_cached() {
    let cache = cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = CacheKey::detail("task", 1);

    let first = cache.ensure_fresh(&key, counting(&calls)).await.unwrap();
    let second = cache.ensure_fresh(&key, counting(&calls)).await.unwrap();

    assert_eq!(first, json!({"n": 1}));
    assert_eq!(second, json!({"n": 1}));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.read(&key), Some(json!({"n": 1})));
}

#[tokio::test]
async fn concurrent_ensure_fresh_shares_one_fetch() {
    let cache = cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());
    let key = CacheKey::list("projects");

    let waiters: Vec<_> = (0..5)
        .map(|_| {
            let cache = cache.clone();
            let key = key.clone();
            let f = gated(&calls, &gate);
            tokio::spawn(async move { cache.ensure_fresh(&key, f).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(cache.is_fetching(&key));
    gate.notify_waiters();

    for waiter in waiters {
        let value = timeout(WAIT, waiter).await.unwrap().unwrap().unwrap();
        assert_eq!(value, json!({"n": 1}));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!cache.is_fetching(&key));
}

#[tokio::test]
async fn zero_window_is_always_stale() {
    let cache = cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = CacheKey::list("dashboard");

    cache.ensure_fresh_with(&key, Some(Duration::ZERO), counting(&calls)).await.unwrap();
    let value = cache.ensure_fresh_with(&key, Some(Duration::ZERO), counting(&calls)).await.unwrap();

    assert_eq!(value, json!({"n": 2}));
    assert!(cache.is_stale(&key));
}

#[tokio::test]
async fn window_expiry_makes_entry_stale() {
    let cache = cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = CacheKey::list("time_summary");
    let window = Some(Duration::from_millis(30));

    cache.ensure_fresh_with(&key, window, counting(&calls)).await.unwrap();
    assert!(!cache.is_stale(&key));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cache.is_stale(&key));

    let value = cache.ensure_fresh_with(&key, window, counting(&calls)).await.unwrap();
    assert_eq!(value, json!({"n": 2}));
}

#[tokio::test]
async fn failed_fetch_keeps_previous_value() {
    let cache = cache();
    let key = CacheKey::detail("project", 3);
    cache.write(&key, json!({"name": "Apollo"}));
    cache.invalidate(&key);

    let err = cache.ensure_fresh(&key, failing()).await.unwrap_err();

    assert_eq!(err, FetchError::Failed("503".into()));
    assert_eq!(cache.read(&key), Some(json!({"name": "Apollo"})));
    assert!(cache.is_stale(&key));
}

// =============================================================================
// INVALIDATION
// =============================================================================

#[tokio::test]
async fn invalidate_hits_every_matching_entry() {
    let cache = cache();
    cache.write(&CacheKey::list("tasks"), json!([]));
    cache.write(&CacheKey::list("tasks").with("status", "open"), json!([]));
    cache.write(&CacheKey::list("tasks").with("project_id", 7), json!([]));
    cache.write(&CacheKey::list("projects"), json!([]));

    assert_eq!(cache.invalidate(&CacheKey::list("tasks")), 3);
    assert!(cache.is_stale(&CacheKey::list("tasks").with("status", "open")));
    assert!(!cache.is_stale(&CacheKey::list("projects")));
}

#[tokio::test]
async fn unwatched_invalidation_waits_for_next_read() {
    let cache = cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = CacheKey::detail("task", 5);
    cache.ensure_fresh(&key, counting(&calls)).await.unwrap();

    cache.invalidate(&key);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The read returns the old value and kicks the refetch.
    assert_eq!(cache.read(&key), Some(json!({"n": 1})));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.read(&key), Some(json!({"n": 2})));
}

#[tokio::test]
async fn watched_invalidation_refetches_and_notifies() {
    let cache = cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = CacheKey::list("notifications");
    let mut sub = cache.subscribe_with(&key, counting(&calls));

    assert!(timeout(WAIT, sub.changed()).await.unwrap());
    assert_eq!(sub.current(), Some(json!({"n": 1})));

    cache.invalidate(&CacheKey::list("notifications"));
    assert!(timeout(WAIT, sub.changed()).await.unwrap());
    assert_eq!(sub.current(), Some(json!({"n": 2})));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn invalidation_supersedes_in_flight_fetch() {
    let cache = cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());
    let key = CacheKey::detail("task", 8);

    let pending = {
        let cache = cache.clone();
        let key = key.clone();
        let f = gated(&calls, &gate);
        tokio::spawn(async move { cache.ensure_fresh(&key, f).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cache.invalidate(&key);
    gate.notify_waiters();

    // The caller still gets its answer, but the cache does not keep it.
    assert_eq!(timeout(WAIT, pending).await.unwrap().unwrap().unwrap(), json!({"n": 1}));
    assert!(cache.is_stale(&key));
}

#[tokio::test]
async fn cancelled_caller_does_not_strand_the_fetch() {
    let cache = cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());
    let key = CacheKey::detail("task", 11);

    let abandoned = timeout(Duration::from_millis(20), cache.ensure_fresh(&key, gated(&calls, &gate))).await;
    assert!(abandoned.is_err());
    assert!(cache.is_fetching(&key));

    gate.notify_waiters();
    timeout(WAIT, async {
        while cache.is_fetching(&key) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(cache.read(&key), Some(json!({"n": 1})));
    assert_eq!(cache.ensure_fresh(&key, counting(&calls)).await.unwrap(), json!({"n": 1}));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn invalidation_without_runtime_stays_lazy() {
    let cache = cache();
    let key = CacheKey::list("tasks");
    cache.write(&key, json!([1]));
    let _sub = cache.subscribe_with(&key, counting(&Arc::new(AtomicUsize::new(0))));

    assert_eq!(cache.invalidate(&key), 1);
    assert!(cache.is_stale(&key));
    assert_eq!(cache.read(&key), Some(json!([1])));
}

// =============================================================================
// WRITE / REMOVE / SUBSCRIBE / GC
// =============================================================================

#[tokio::test]
async fn write_notifies_subscribers_and_clears_staleness() {
    let cache = cache();
    let key = CacheKey::detail("user", "u-1");
    let mut sub = cache.subscribe(&key);
    assert_eq!(sub.current(), None);

    cache.write(&key, json!({"name": "Ada"}));

    assert!(timeout(WAIT, sub.changed()).await.unwrap());
    assert_eq!(sub.current(), Some(json!({"name": "Ada"})));
    assert!(!cache.is_stale(&key));
}

#[tokio::test]
async fn remove_evicts_value_but_keeps_watchers() {
    let cache = cache();
    let key = CacheKey::detail("task", 9);
    cache.write(&key, json!({"id": 9}));
    let mut sub = cache.subscribe(&key);

    assert!(cache.remove(&key));
    assert!(timeout(WAIT, sub.changed()).await.unwrap());
    assert_eq!(sub.current(), None);
    assert_eq!(cache.read(&key), None);
    assert_eq!(cache.subscriber_count(&key), 1);

    drop(sub);
    assert!(cache.remove(&key));
    assert!(!cache.contains(&key));
    assert!(!cache.remove(&key));
}

#[test]
fn subscription_drop_releases_interest() {
    let cache = cache();
    let key = CacheKey::list("projects");
    let a = cache.subscribe(&key);
    let b = cache.subscribe(&key);
    assert_eq!(cache.subscriber_count(&key), 2);
    drop(a);
    assert_eq!(cache.subscriber_count(&key), 1);
    drop(b);
    assert_eq!(cache.subscriber_count(&key), 0);
}

#[test]
fn gc_evicts_only_idle_stale_unobserved_entries() {
    let cache = QueryCache::new(Some(Duration::from_secs(30)), Duration::from_secs(60));
    let idle = CacheKey::list("projects");
    let watched = CacheKey::list("tasks");
    cache.write(&idle, json!([]));
    cache.write(&watched, json!([]));
    let _sub = cache.subscribe(&watched);

    assert_eq!(cache.collect_garbage_at(Instant::now()), 0);
    let later = Instant::now() + Duration::from_secs(61);
    assert_eq!(cache.collect_garbage_at(later), 1);
    assert!(!cache.contains(&idle));
    assert!(cache.contains(&watched));
}

#[test]
fn gc_keeps_never_stale_entries() {
    let cache = QueryCache::new(None, Duration::from_secs(1));
    let key = CacheKey::list("users");
    cache.write(&key, json!([]));

    let later = Instant::now() + Duration::from_secs(5);
    assert_eq!(cache.collect_garbage_at(later), 0);
    cache.invalidate(&key);
    assert_eq!(cache.collect_garbage_at(later), 1);
}

#[test]
fn gc_spares_entry_with_pending_patch() {
    let cache = QueryCache::new(Some(Duration::ZERO), Duration::from_secs(1));
    let key = CacheKey::detail("task", 1);
    cache.write(&key, json!({"id": 1}));
    let _snapshot = cache.begin_patch(&key);

    assert_eq!(cache.collect_garbage_at(Instant::now() + Duration::from_secs(5)), 0);
    assert!(cache.contains(&key));
}

#[test]
fn clear_drops_values() {
    let cache = cache();
    let watched = CacheKey::list("tasks");
    cache.write(&CacheKey::list("projects"), json!([]));
    cache.write(&watched, json!([]));
    let sub = cache.subscribe(&watched);

    cache.clear();

    assert_eq!(cache.len(), 1);
    assert_eq!(sub.current(), None);
    assert_eq!(cache.read(&watched), None);
}

// =============================================================================
// PATCH HOOKS
// =============================================================================

#[test]
fn revert_restores_snapshot_exactly() {
    let cache = cache();
    let key = CacheKey::detail("task", 2);
    cache.write(&key, json!({"title": "old"}));
    let stale_before = cache.is_stale(&key);

    let snapshot = cache.begin_patch(&key);
    cache.apply_speculative(&key, json!({"title": "new"}));
    assert_eq!(cache.read(&key), Some(json!({"title": "new"})));
    cache.settle_patch(&key, Settle::Revert(snapshot));

    assert_eq!(cache.read(&key), Some(json!({"title": "old"})));
    assert_eq!(cache.is_stale(&key), stale_before);
}

#[test]
fn invalidation_during_patch_is_deferred_until_settle() {
    let cache = cache();
    let key = CacheKey::detail("task", 3);
    cache.write(&key, json!({"title": "old"}));

    let snapshot = cache.begin_patch(&key);
    cache.apply_speculative(&key, json!({"title": "new"}));
    assert_eq!(cache.invalidate(&CacheKey::list("task")), 1);
    assert!(!cache.is_stale(&key));
    assert_eq!(cache.read(&key), Some(json!({"title": "new"})));

    cache.settle_patch(&key, Settle::Revert(snapshot));
    assert_eq!(cache.read(&key), Some(json!({"title": "old"})));
    assert!(cache.is_stale(&key));
}

#[test]
fn removal_during_patch_keeps_speculative_value_until_settle() {
    let cache = cache();
    let key = CacheKey::detail("task", 5);
    cache.write(&key, json!({"title": "old"}));

    let snapshot = cache.begin_patch(&key);
    cache.apply_speculative(&key, json!({"title": "new"}));
    assert!(cache.remove(&key));
    assert_eq!(cache.read(&key), Some(json!({"title": "new"})));

    cache.settle_patch(&key, Settle::Revert(snapshot));
    assert_eq!(cache.read(&key), None);
    assert!(!cache.contains(&key));
}

#[tokio::test]
async fn removal_during_patch_clears_watched_value_on_confirm() {
    let cache = cache();
    let key = CacheKey::detail("task", 6);
    cache.write(&key, json!({"title": "old"}));
    let sub = cache.subscribe(&key);

    let _ = cache.begin_patch(&key);
    cache.apply_speculative(&key, json!({"title": "new"}));
    cache.remove(&key);
    cache.settle_patch(&key, Settle::Reconcile(json!({"title": "server"})));

    assert_eq!(sub.current(), None);
    assert!(cache.contains(&key));
    assert!(!cache.is_fetching(&key));
}

#[test]
fn evict_settle_clears_value() {
    let cache = cache();
    let key = CacheKey::detail("comment", 4);
    cache.write(&key, json!({"body": "hi"}));
    let _ = cache.begin_patch(&key);

    cache.settle_patch(&key, Settle::Evict);

    assert_eq!(cache.read(&key), None);
}
