use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use huginn::{
    Cache, CacheError, CacheOptions, Query, QueryResult, QueryStatus, Response, request_fn,
};
use serde_json::json;

/// Query that fails `failures` times, then succeeds.
fn fail_then_succeed(failures: u32, calls: Arc<AtomicU32>) -> Query<(), ()> {
    Query::new(move |_, _| {
        let calls = calls.clone();
        request_fn(move || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    let failure = Response::failure(json!({"message": "busy"}));
                    Ok(failure.with_status(503, "Unavailable"))
                } else {
                    Ok(Response::success(json!("ok")))
                }
            }
        })
    })
}

/// Query whose first send breaks the transport.
fn fault_once(calls: Arc<AtomicU32>) -> Query<(), ()> {
    Query::new(move |_, _| {
        let calls = calls.clone();
        request_fn(move || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(CacheError::Transport("connection reset".into()))
                } else {
                    Ok(Response::success(json!("ok")))
                }
            }
        })
    })
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn failures_are_retried_until_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let cache = Cache::new(());
    let entry = cache
        .query(
            &fail_then_succeed(2, calls.clone()),
            &(),
            CacheOptions::new().retry_limit(3),
        )
        .unwrap();
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(cache.get(&entry.key).unwrap().data(), Some(&json!("ok")));
}

#[tokio::test(start_paused = true)]
async fn retry_limit_zero_sends_once() {
    let calls = Arc::new(AtomicU32::new(0));
    let cache = Cache::new(());
    let entry = cache
        .query(
            &fail_then_succeed(1, calls.clone()),
            &(),
            CacheOptions::new().retry_limit(0),
        )
        .unwrap();
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get(&entry.key).unwrap().status(), QueryStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_store_the_last_failure() {
    let calls = Arc::new(AtomicU32::new(0));
    let cache = Cache::new(());
    let entry = cache
        .query(
            &fail_then_succeed(u32::MAX, calls.clone()),
            &(),
            CacheOptions::new().retry_limit(2),
        )
        .unwrap();
    settle().await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let result = cache.get(&entry.key).unwrap();
    assert_eq!(result.error(), Some(&json!({"message": "busy"})));
    let meta = result.meta().unwrap();
    assert_eq!(meta.status, Some(503));
    assert_eq!(meta.status_text.as_deref(), Some("Unavailable"));
}

#[tokio::test(start_paused = true)]
async fn transport_fault_is_not_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let cache = Cache::new(());
    let entry = cache
        .query(
            &fault_once(calls.clone()),
            &(),
            CacheOptions::new().ttl(Duration::from_secs(1)),
        )
        .unwrap();
    // Let the spawned initial fetch run into the fault.
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get(&entry.key).unwrap(), QueryResult::Loading);

    // Retries are for failure responses only.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn next_tick_recovers_from_a_fault() {
    let calls = Arc::new(AtomicU32::new(0));
    let cache = Cache::new(());
    let entry = cache
        .query(
            &fault_once(calls.clone()),
            &(),
            CacheOptions::new().ttl(Duration::from_secs(1)),
        )
        .unwrap();
    settle().await;
    assert_eq!(cache.get(&entry.key).unwrap(), QueryResult::Loading);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.get(&entry.key).unwrap().data(), Some(&json!("ok")));
}

#[tokio::test(start_paused = true)]
async fn explicit_fetch_returns_transport_faults() {
    let failing: Query<(), ()> = Query::new(|_, _| {
        request_fn(|| async { Err(CacheError::Transport("dns".into())) })
    });
    let cache = Cache::new(());
    let entry = cache.query(&failing, &(), CacheOptions::default()).unwrap();
    settle().await;

    let err = cache.fetch(&entry.key, true).await.unwrap_err();
    assert!(err.is_transport());
    assert_eq!(cache.get(&entry.key).unwrap(), QueryResult::Loading);
}
