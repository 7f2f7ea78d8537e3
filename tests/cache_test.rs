//! Registry behaviour: creation, lookup, deduplication, eviction.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use huginn::{Cache, CacheError, CacheOptions, Query, QueryResult, Response, request_fn};
use serde_json::json;

// ============================================================================
// Helpers
// ============================================================================

/// Query answering `n` and counting how often it was sent.
fn counted(calls: Arc<AtomicU32>) -> Query<(), u32> {
    Query::new(move |_, n: &u32| {
        let (calls, n) = (calls.clone(), *n);
        request_fn(move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Response::success(json!(n)))
            }
        })
    })
}

/// Query whose response takes `delay` to arrive.
fn slow(calls: Arc<AtomicU32>, delay: Duration) -> Query<(), u32> {
    Query::new(move |_, n: &u32| {
        let (calls, n) = (calls.clone(), *n);
        request_fn(move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(Response::success(json!(n)))
            }
        })
    })
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn query_creates_and_fetches() {
    let calls = Arc::new(AtomicU32::new(0));
    let cache = Cache::new(());
    let entry = cache
        .query(&counted(calls.clone()), &7, CacheOptions::default())
        .unwrap();

    assert_eq!(cache.get(&entry.key).unwrap(), QueryResult::Loading);
    settle().await;
    assert_eq!(cache.get(&entry.key).unwrap().data(), Some(&json!(7)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn equal_arguments_share_an_entry() {
    let calls = Arc::new(AtomicU32::new(0));
    let query = counted(calls.clone());
    let cache = Cache::new(());

    let a = cache.query(&query, &1, CacheOptions::default()).unwrap();
    let b = cache.query(&query, &1, CacheOptions::default()).unwrap();
    assert_eq!(a, b);
    assert_eq!(cache.len(), 1);

    cache.query(&query, &2, CacheOptions::default()).unwrap();
    assert_eq!(cache.len(), 2);

    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn separate_queries_never_share_entries() {
    let calls = Arc::new(AtomicU32::new(0));
    let cache = Cache::new(());
    let a = cache
        .query(&counted(calls.clone()), &1, CacheOptions::default())
        .unwrap();
    let b = cache
        .query(&counted(calls.clone()), &1, CacheOptions::default())
        .unwrap();
    assert_ne!(a.key, b.key);
}

#[tokio::test(start_paused = true)]
async fn create_rejects_a_live_key() {
    let query = counted(Arc::new(AtomicU32::new(0)));
    let cache = Cache::new(());
    let entry = cache.query(&query, &1, CacheOptions::default()).unwrap();

    let err = cache
        .create(entry.key.clone(), query.bind(&1), CacheOptions::default())
        .unwrap_err();
    assert!(matches!(err, CacheError::DuplicateEntry(key) if key == entry.key));
}

#[tokio::test(start_paused = true)]
async fn unknown_keys_are_reported() {
    let cache = Cache::new(());
    assert!(cache.get("nope").unwrap_err().is_missing_entry());
    assert!(cache.sync("nope").unwrap_err().is_missing_entry());
    assert!(cache.subscribe("nope", |_| {}).unwrap_err().is_missing_entry());
    assert!(
        cache
            .set_options("nope", CacheOptions::new().retry_limit(0))
            .unwrap_err()
            .is_missing_entry()
    );
    assert!(cache.invalidate("nope").unwrap_err().is_missing_entry());
    assert!(cache.refetch("nope", true, true).unwrap_err().is_missing_entry());
    assert!(cache.fetch("nope", true).await.unwrap_err().is_missing_entry());
    assert!(!cache.evict("nope"));
}

#[tokio::test(start_paused = true)]
async fn subscription_snapshot_matches_entry() {
    let cache = Cache::new(());
    let entry = cache
        .query(&counted(Arc::new(AtomicU32::new(0))), &3, CacheOptions::default())
        .unwrap();
    settle().await;

    let subscription = cache.subscribe(&entry.key, |_| {}).unwrap();
    assert_eq!(subscription.key(), entry.key);
    assert_eq!(subscription.sync(), cache.sync(&entry.key).unwrap());
    assert_eq!(subscription.result().data(), Some(&json!(3)));
}

#[tokio::test(start_paused = true)]
async fn callbacks_run_in_subscription_order() {
    let cache = Cache::new(());
    let entry = cache
        .query(&counted(Arc::new(AtomicU32::new(0))), &1, CacheOptions::default())
        .unwrap();
    settle().await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let first = {
        let seen = seen.clone();
        cache
            .subscribe(&entry.key, move |_| seen.lock().unwrap().push("first"))
            .unwrap()
    };
    let second = {
        let seen = seen.clone();
        cache
            .subscribe(&entry.key, move |_| seen.lock().unwrap().push("second"))
            .unwrap()
    };

    cache.invalidate(&entry.key).unwrap();
    settle().await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["first", "second", "first", "second"]
    );

    drop(first);
    drop(second);
}

#[tokio::test(start_paused = true)]
async fn unsubscribed_callbacks_stop_hearing() {
    let cache = Cache::new(());
    let entry = cache
        .query(&counted(Arc::new(AtomicU32::new(0))), &1, CacheOptions::default())
        .unwrap();
    settle().await;

    let hits = Arc::new(AtomicU32::new(0));
    let subscription = {
        let hits = hits.clone();
        cache
            .subscribe(&entry.key, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
    };
    subscription.unsubscribe();

    cache.invalidate(&entry.key).unwrap();
    settle().await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn fetch_joins_the_fetch_in_flight() {
    let calls = Arc::new(AtomicU32::new(0));
    let cache = Cache::new(());
    let entry = cache
        .query(
            &slow(calls.clone(), Duration::from_millis(100)),
            &1,
            CacheOptions::default(),
        )
        .unwrap();

    cache.fetch(&entry.key, false).await.unwrap();
    assert_eq!(cache.get(&entry.key).unwrap(), QueryResult::Loading);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(cache.get(&entry.key).unwrap().is_success());
}

#[tokio::test(start_paused = true)]
async fn forced_fetch_supersedes_the_one_in_flight() {
    let calls = Arc::new(AtomicU32::new(0));
    let query: Query<(), ()> = {
        let calls = calls.clone();
        Query::new(move |_, _| {
            let calls = calls.clone();
            request_fn(move || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(Response::success(json!("old")))
                    } else {
                        Ok(Response::success(json!("new")))
                    }
                }
            })
        })
    };
    let cache = Cache::new(());
    let entry = cache.query(&query, &(), CacheOptions::default()).unwrap();
    settle().await;

    cache.fetch(&entry.key, true).await.unwrap();
    assert_eq!(cache.get(&entry.key).unwrap().data(), Some(&json!("new")));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.get(&entry.key).unwrap().data(), Some(&json!("new")));
}

#[tokio::test(start_paused = true)]
async fn evict_and_reset() {
    let query = counted(Arc::new(AtomicU32::new(0)));
    let cache = Cache::new(());
    let a = cache.query(&query, &1, CacheOptions::default()).unwrap();
    let b = cache.query(&query, &2, CacheOptions::default()).unwrap();

    assert!(cache.evict(&a.key));
    assert!(!cache.contains(&a.key));
    assert!(cache.contains(&b.key));

    let mut expected = vec![b.key.clone()];
    let c = cache.query(&query, &3, CacheOptions::default()).unwrap();
    expected.push(c.key);
    expected.sort();
    assert_eq!(cache.keys(), expected);

    cache.reset_all();
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn recreated_entries_get_fresh_ids() {
    let query = counted(Arc::new(AtomicU32::new(0)));
    let cache = Cache::new(());
    let first = cache.query(&query, &1, CacheOptions::default()).unwrap();
    cache.evict(&first.key);
    let second = cache.query(&query, &1, CacheOptions::default()).unwrap();
    assert_eq!(first.key, second.key);
    assert_ne!(first.id, second.id);
}

#[tokio::test(start_paused = true)]
async fn prefetch_fetches_without_subscribing() {
    let calls = Arc::new(AtomicU32::new(0));
    let query = counted(calls.clone());
    let cache = Cache::new(());

    let entry = cache.prefetch(&query, &4).unwrap();
    settle().await;
    assert_eq!(cache.get(&entry.key).unwrap().data(), Some(&json!(4)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A second prefetch reuses the entry and fetches it again.
    let again = cache.prefetch(&query, &4).unwrap();
    assert_eq!(again, entry);
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.len(), 1);
}
