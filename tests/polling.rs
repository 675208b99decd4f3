// Integration tests for polling and connectivity sweeps

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use requery::prelude::*;
use serde_json::{Value, json};
use tokio::time::{Duration, Instant, sleep, timeout};

fn post_api() -> Api {
    Api::new().endpoint(Endpoint::query("getPost"))
}

fn counting_transport(calls: Arc<AtomicUsize>) -> impl Transport {
    move |_request: TransportRequest, _ctx: TransportContext| {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Ok::<_, Value>(json!({"call": n})) }.boxed()
    }
}

fn polling_options(interval: Duration) -> QueryOptions {
    QueryOptions {
        subscription_options: SubscriptionOptions {
            polling_interval: Some(interval),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn call_of(state: &CacheState, key: &CacheKey) -> u64 {
    state
        .queries
        .get(key)
        .and_then(|record| record.data.as_ref())
        .and_then(|data| data["call"].as_u64())
        .unwrap_or(0)
}

async fn wait_until(engine: &CacheEngine, mut pred: impl FnMut(&CacheState) -> bool) {
    let mut snapshots = engine.watch_state();
    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        if pred(&snapshot) {
            return;
        }
        snapshots.changed().await.expect("engine pipeline stopped");
    }
}

#[tokio::test(start_paused = true)]
async fn test_polling_uses_minimum_subscriber_interval() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = CacheEngine::builder(post_api(), counting_transport(calls.clone())).spawn();

    let mut slow = engine
        .query_with("getPost", json!("3"), polling_options(Duration::from_millis(500)))
        .await
        .unwrap();
    slow.result().await.unwrap();
    let _fast = engine
        .query_with("getPost", json!("3"), polling_options(Duration::from_millis(300)))
        .await
        .unwrap();

    let key = default_cache_key("getPost", &json!("3"));
    let started = Instant::now();
    timeout(
        Duration::from_secs(5),
        wait_until(&engine, |state| call_of(state, &key) >= 3),
    )
    .await
    .unwrap();

    // Two poll ticks at the 300ms minimum, not at 500ms.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(600));
    assert!(elapsed < Duration::from_millis(1000));
}

#[tokio::test(start_paused = true)]
async fn test_interval_reselected_when_fast_subscriber_leaves() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = CacheEngine::builder(post_api(), counting_transport(calls.clone())).spawn();

    let mut slow = engine
        .query_with("getPost", json!("3"), polling_options(Duration::from_secs(2)))
        .await
        .unwrap();
    slow.result().await.unwrap();
    let fast = engine
        .query_with("getPost", json!("3"), polling_options(Duration::from_millis(100)))
        .await
        .unwrap();
    fast.unsubscribe();

    let key = default_cache_key("getPost", &json!("3"));
    let started = Instant::now();
    timeout(
        Duration::from_secs(10),
        wait_until(&engine, |state| call_of(state, &key) >= 2),
    )
    .await
    .unwrap();

    // The 100ms subscriber is gone; the next tick had to wait the full 2s.
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_polling_stops_when_last_subscriber_leaves() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = CacheEngine::builder(post_api(), counting_transport(calls.clone())).spawn();

    let mut handle = engine
        .query_with("getPost", json!("3"), polling_options(Duration::from_millis(200)))
        .await
        .unwrap();
    handle.result().await.unwrap();
    let key = handle.cache_key().clone();
    handle.unsubscribe();
    timeout(
        Duration::from_secs(5),
        wait_until(&engine, |state| state.subscriber_count(&key) == 0),
    )
    .await
    .unwrap();

    let before = calls.load(Ordering::SeqCst);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), before);
}

#[tokio::test(start_paused = true)]
async fn test_options_update_rearms_poll_timer() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = CacheEngine::builder(post_api(), counting_transport(calls.clone())).spawn();

    let mut handle = engine.query("getPost", json!("3")).await.unwrap();
    handle.result().await.unwrap();

    // No polling configured yet.
    sleep(Duration::from_secs(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    handle.update_subscription_options(SubscriptionOptions {
        polling_interval: Some(Duration::from_millis(250)),
        ..Default::default()
    });

    let key = default_cache_key("getPost", &json!("3"));
    timeout(
        Duration::from_secs(5),
        wait_until(&engine, |state| call_of(state, &key) >= 2),
    )
    .await
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_focus_sweep_refetches_opted_in_subscriber() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine = CacheEngine::builder(post_api(), counting_transport(calls.clone())).spawn();

    let options = QueryOptions {
        subscription_options: SubscriptionOptions {
            refetch_on_focus: Some(true),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut handle = engine.query_with("getPost", json!("3"), options).await.unwrap();
    handle.result().await.unwrap();

    engine.set_focused(false);
    engine.set_focused(true);

    let key = default_cache_key("getPost", &json!("3"));
    timeout(
        Duration::from_secs(5),
        wait_until(&engine, |state| call_of(state, &key) >= 2),
    )
    .await
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_sweep_respects_opt_out() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = CacheConfig {
        refetch_on_reconnect: true,
        ..Default::default()
    };
    let engine = CacheEngine::builder(post_api(), counting_transport(calls.clone()))
        .config(config)
        .spawn();

    let options = QueryOptions {
        subscription_options: SubscriptionOptions {
            refetch_on_reconnect: Some(false),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut handle = engine.query_with("getPost", json!("3"), options).await.unwrap();
    handle.result().await.unwrap();

    engine.set_online(false);
    engine.set_online(true);

    sleep(Duration::from_secs(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_sweep_uses_global_default() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = CacheConfig {
        refetch_on_reconnect: true,
        ..Default::default()
    };
    let engine = CacheEngine::builder(post_api(), counting_transport(calls.clone()))
        .config(config)
        .spawn();

    let mut handle = engine.query("getPost", json!("3")).await.unwrap();
    handle.result().await.unwrap();

    engine.set_online(false);
    engine.set_online(true);

    let key = default_cache_key("getPost", &json!("3"));
    timeout(
        Duration::from_secs(5),
        wait_until(&engine, |state| call_of(state, &key) >= 2),
    )
    .await
    .unwrap();
}
