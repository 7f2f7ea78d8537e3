//! Dependent computations: edges, propagation, rewiring and cycles.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use huginn::{
    Cache, CacheError, CacheOptions, GetterOptions, Query, QueryResult, Resolved, Response,
    request_fn,
};
use serde_json::{Value, json};

// ============================================================================
// Helpers
// ============================================================================

/// Query answering its argument.
fn echo() -> Query<(), u32> {
    Query::new(|_, n: &u32| {
        let n = *n;
        request_fn(move || async move { Ok(Response::success(json!(n))) })
    })
}

/// Query answering a fixed value.
fn constant(value: Value) -> Query<(), ()> {
    Query::new(move |_, _| {
        let value = value.clone();
        request_fn(move || {
            let value = value.clone();
            async move { Ok(Response::success(value)) }
        })
    })
}

/// Query answering the current state of `flag`.
fn switch(flag: Arc<AtomicBool>) -> Query<(), ()> {
    Query::new(move |_, _| {
        let flag = flag.clone();
        request_fn(move || {
            let flag = flag.clone();
            async move { Ok(Response::success(json!(flag.load(Ordering::SeqCst)))) }
        })
    })
}

/// Dependent doubling `base(n)`, counting its evaluations.
fn doubled(base: Query<(), u32>, evaluations: Arc<AtomicU32>) -> Query<(), u32> {
    Query::dependent(move |get, n| {
        evaluations.fetch_add(1, Ordering::SeqCst);
        let upstream = get.get(&base, n)?;
        Ok(Resolved::Value(match upstream.data().and_then(Value::as_u64) {
            Some(v) => QueryResult::success(json!(v * 2)),
            None => QueryResult::Loading,
        }))
    })
}

/// Query answering how many times it was sent.
fn counting(calls: Arc<AtomicU32>) -> Query<(), u32> {
    Query::new(move |_, _| {
        let calls = calls.clone();
        request_fn(move || {
            let calls = calls.clone();
            async move { Ok(Response::success(json!(calls.fetch_add(1, Ordering::SeqCst) + 1))) }
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
async fn dependent_follows_its_upstream() {
    let base = echo();
    let evaluations = Arc::new(AtomicU32::new(0));
    let cache = Cache::new(());
    let entry = cache
        .query(
            &doubled(base.clone(), evaluations.clone()),
            &21,
            CacheOptions::default(),
        )
        .unwrap();
    assert_eq!(cache.get(&entry.key).unwrap(), QueryResult::Loading);

    settle().await;
    assert_eq!(cache.get(&entry.key).unwrap().data(), Some(&json!(42)));
    assert_eq!(evaluations.load(Ordering::SeqCst), 2);

    let base_key = base.key(cache.hasher(), &21).unwrap();
    assert_eq!(cache.dependencies(&entry.key).unwrap(), vec![base_key.clone()]);
    assert_eq!(cache.dependents(&base_key).unwrap(), vec![entry.key.clone()]);
}

#[tokio::test(start_paused = true)]
async fn each_upstream_result_reevaluates_once() {
    let base = echo();
    let evaluations = Arc::new(AtomicU32::new(0));
    let sum: Query<(), ()> = {
        let evaluations = evaluations.clone();
        Query::dependent(move |get, _| {
            evaluations.fetch_add(1, Ordering::SeqCst);
            let a = get.get(&base, &1)?;
            let b = get.get(&base, &2)?;
            Ok(Resolved::Value(
                match (
                    a.data().and_then(Value::as_u64),
                    b.data().and_then(Value::as_u64),
                ) {
                    (Some(a), Some(b)) => QueryResult::success(json!(a + b)),
                    _ => QueryResult::Loading,
                },
            ))
        })
    };
    let cache = Cache::new(());
    let entry = cache.query(&sum, &(), CacheOptions::default()).unwrap();

    settle().await;
    assert_eq!(cache.get(&entry.key).unwrap().data(), Some(&json!(3)));
    assert_eq!(evaluations.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn recalculation_predicate_filters_upstream_results() {
    let base = echo();
    let evaluations = Arc::new(AtomicU32::new(0));
    let lazy: Query<(), u32> = {
        let evaluations = evaluations.clone();
        Query::dependent(move |get, n| {
            evaluations.fetch_add(1, Ordering::SeqCst);
            let options = GetterOptions::new().should_recalculate(|_| false);
            Ok(Resolved::Value(get.get_with(&base, n, options)?))
        })
    };
    let cache = Cache::new(());
    let entry = cache.query(&lazy, &1, CacheOptions::default()).unwrap();

    settle().await;
    assert_eq!(evaluations.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get(&entry.key).unwrap(), QueryResult::Loading);
}

#[tokio::test(start_paused = true)]
async fn dependent_can_become_a_request() {
    let user: Query<(), u32> = Query::new(|_, id: &u32| {
        let id = *id;
        request_fn(move || async move { Ok(Response::success(json!({"id": id, "team": 7}))) })
    });
    let team: Query<(), u32> = Query::dependent(move |get, id| {
        let user = get.get(&user, id)?;
        Ok(match user.data().and_then(|u| u.get("team")).cloned() {
            Some(team) => Resolved::Request(request_fn(move || {
                let team = team.clone();
                async move { Ok(Response::success(json!({"team": team, "name": "core"}))) }
            })),
            None => Resolved::Value(QueryResult::Loading),
        })
    });

    let cache = Cache::new(());
    let entry = cache.query(&team, &1, CacheOptions::default()).unwrap();
    settle().await;

    let result = cache.get(&entry.key).unwrap();
    assert_eq!(result.data(), Some(&json!({"team": 7, "name": "core"})));
}

#[tokio::test(start_paused = true)]
async fn edges_follow_what_the_last_evaluation_read() {
    let flag = Arc::new(AtomicBool::new(false));
    let switch = switch(flag.clone());
    let left = constant(json!("L"));
    let right = constant(json!("R"));
    let pick: Query<(), ()> = {
        let (switch, left, right) = (switch.clone(), left.clone(), right.clone());
        Query::dependent(move |get, _| {
            let side = get.get(&switch, &())?;
            Ok(Resolved::Value(match side.data().and_then(Value::as_bool) {
                Some(true) => get.get(&left, &())?,
                Some(false) => get.get(&right, &())?,
                None => QueryResult::Loading,
            }))
        })
    };

    let cache = Cache::new(());
    let entry = cache.query(&pick, &(), CacheOptions::default()).unwrap();
    settle().await;

    let switch_key = switch.key(cache.hasher(), &()).unwrap();
    let left_key = left.key(cache.hasher(), &()).unwrap();
    let right_key = right.key(cache.hasher(), &()).unwrap();
    assert_eq!(cache.get(&entry.key).unwrap().data(), Some(&json!("R")));
    assert_eq!(
        cache.dependencies(&entry.key).unwrap(),
        vec![switch_key.clone(), right_key.clone()]
    );

    flag.store(true, Ordering::SeqCst);
    cache.invalidate(&switch_key).unwrap();
    settle().await;

    assert_eq!(cache.get(&entry.key).unwrap().data(), Some(&json!("L")));
    assert_eq!(
        cache.dependencies(&entry.key).unwrap(),
        vec![switch_key, left_key]
    );
    assert!(cache.dependents(&right_key).unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dependents_keep_upstreams_alive() {
    let base = echo();
    let cache = Cache::builder(())
        .defaults(
            CacheOptions::new()
                .stop_refetch_delay(Duration::from_secs(2))
                .evict_delay(Duration::from_secs(5)),
        )
        .build();
    let entry = cache
        .query(
            &doubled(base.clone(), Arc::new(AtomicU32::new(0))),
            &1,
            CacheOptions::default(),
        )
        .unwrap();
    let base_key = base.key(cache.hasher(), &1).unwrap();
    let subscription = cache.subscribe(&entry.key, |_| {}).unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(cache.contains(&base_key));

    drop(subscription);
    tokio::time::sleep(Duration::from_secs(7)).await;
    assert!(!cache.contains(&entry.key));
    assert!(cache.contains(&base_key));

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(!cache.contains(&base_key));
}

#[tokio::test(start_paused = true)]
async fn new_dependent_restarts_a_stopped_upstream() {
    let calls = Arc::new(AtomicU32::new(0));
    let base = counting(calls.clone());
    let cache = Cache::builder(())
        .defaults(
            CacheOptions::new()
                .ttl(Duration::from_secs(1))
                .stop_refetch_delay(Duration::from_millis(2500))
                .evict_delay(Duration::from_secs(100)),
        )
        .build();
    cache.query(&base, &1, CacheOptions::default()).unwrap();

    tokio::time::sleep(Duration::from_millis(3500)).await;
    let stopped_at = calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(calls.load(Ordering::SeqCst), stopped_at);

    let entry = cache
        .query(
            &doubled(base.clone(), Arc::new(AtomicU32::new(0))),
            &1,
            CacheOptions::default(),
        )
        .unwrap();
    let _subscription = cache.subscribe(&entry.key, |_| {}).unwrap();
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), stopped_at + 1);
    let fresh = u64::from(stopped_at + 1) * 2;
    assert_eq!(cache.get(&entry.key).unwrap().data(), Some(&json!(fresh)));

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(calls.load(Ordering::SeqCst) >= stopped_at + 4);
}

#[tokio::test(start_paused = true)]
async fn cycle_during_construction_is_rejected() {
    let slot: Arc<OnceLock<Query<(), ()>>> = Arc::new(OnceLock::new());
    let b: Query<(), ()> = {
        let slot = slot.clone();
        Query::dependent(move |get, _| {
            let a = slot.get().expect("a is registered before use");
            Ok(Resolved::Value(get.get(a, &())?))
        })
    };
    let a: Query<(), ()> = Query::dependent(move |get, _| Ok(Resolved::Value(get.get(&b, &())?)));
    slot.set(a.clone()).unwrap();

    let cache = Cache::new(());
    let err = cache.query(&a, &(), CacheOptions::default()).unwrap_err();
    assert!(matches!(err, CacheError::CyclicDependency { .. }));
    assert!(!cache.contains(&a.key(cache.hasher(), &()).unwrap()));
}

#[tokio::test(start_paused = true)]
async fn cycle_during_propagation_is_stored_as_error() {
    let flag = Arc::new(AtomicBool::new(false));
    let switch = switch(flag.clone());
    let slot: Arc<OnceLock<Query<(), ()>>> = Arc::new(OnceLock::new());

    // Reads the entry that reads it.
    let mirror: Query<(), ()> = {
        let slot = slot.clone();
        Query::dependent(move |get, _| {
            let looped = slot.get().expect("looped is registered before use");
            Ok(Resolved::Value(get.get(looped, &())?))
        })
    };
    let looped: Query<(), ()> = {
        let switch = switch.clone();
        Query::dependent(move |get, _| {
            let side = get.get(&switch, &())?;
            if side.data() == Some(&json!(true)) {
                get.get(&mirror, &())?;
            }
            Ok(Resolved::Value(side))
        })
    };
    slot.set(looped.clone()).unwrap();

    let cache = Cache::new(());
    let entry = cache.query(&looped, &(), CacheOptions::default()).unwrap();
    settle().await;
    assert_eq!(cache.get(&entry.key).unwrap().data(), Some(&json!(false)));

    flag.store(true, Ordering::SeqCst);
    let switch_key = switch.key(cache.hasher(), &()).unwrap();
    cache.invalidate(&switch_key).unwrap();
    settle().await;

    let result = cache.get(&entry.key).unwrap();
    let message = result
        .error()
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap();
    assert!(message.contains("cyclic dependency"), "{message}");
    assert_eq!(cache.dependencies(&entry.key).unwrap(), vec![switch_key]);
}
