// Integration tests for tag-based invalidation

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use requery::prelude::*;
use serde_json::{Value, json};
use tokio::time::{Duration, sleep, timeout};

fn post_api() -> Api {
    Api::new()
        .endpoint(Endpoint::query("getPost").provides_fn(|_result, args| {
            vec![Tag::with_id("Post", args.as_str().unwrap_or(""))]
        }))
        .endpoint(Endpoint::query("getPosts").provides([Tag::of("Post")]))
        .endpoint(Endpoint::mutation("updatePost").invalidates_fn(|_result, args| {
            vec![Tag::with_id("Post", args["id"].as_str().unwrap_or(""))]
        }))
        .endpoint(Endpoint::mutation("clearPosts").invalidates([Tag::of("Post")]))
}

/// Transport that stamps each response with a per-(endpoint, args) version.
fn versioned_transport(versions: Arc<Mutex<HashMap<String, u64>>>) -> impl Transport {
    move |request: TransportRequest, _ctx: TransportContext| {
        let version = {
            let mut versions = versions.lock().unwrap();
            let slot = versions
                .entry(format!("{}:{}", request.endpoint, request.args))
                .or_insert(0);
            *slot += 1;
            *slot
        };
        async move { Ok::<_, Value>(json!({"version": version})) }.boxed()
    }
}

fn version_of(state: &CacheState, key: &CacheKey) -> u64 {
    state
        .queries
        .get(key)
        .and_then(|record| record.data.as_ref())
        .and_then(|data| data["version"].as_u64())
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
async fn test_id_invalidation_refetches_only_matching_key() {
    let versions = Arc::new(Mutex::new(HashMap::new()));
    let engine = CacheEngine::builder(post_api(), versioned_transport(versions)).spawn();

    let mut three = engine.query("getPost", json!("3")).await.unwrap();
    let mut four = engine.query("getPost", json!("4")).await.unwrap();
    three.result().await.unwrap();
    four.result().await.unwrap();

    let key3 = default_cache_key("getPost", &json!("3"));
    let key4 = default_cache_key("getPost", &json!("4"));

    let mut update = engine.mutate("updatePost", json!({"id": "3"})).await.unwrap();
    update.result().await.unwrap();

    timeout(
        Duration::from_secs(5),
        wait_until(&engine, |state| version_of(state, &key3) == 2),
    )
    .await
    .unwrap();
    assert_eq!(version_of(&engine.state(), &key4), 1);
}

#[tokio::test(start_paused = true)]
async fn test_wildcard_invalidation_hits_bare_and_id_providers() {
    let versions = Arc::new(Mutex::new(HashMap::new()));
    let engine = CacheEngine::builder(post_api(), versioned_transport(versions)).spawn();

    let mut one = engine.query("getPost", json!("3")).await.unwrap();
    let mut list = engine.query("getPosts", Value::Null).await.unwrap();
    one.result().await.unwrap();
    list.result().await.unwrap();

    let key3 = default_cache_key("getPost", &json!("3"));
    let key_list = default_cache_key("getPosts", &Value::Null);

    let mut clear = engine.mutate("clearPosts", Value::Null).await.unwrap();
    clear.result().await.unwrap();

    timeout(
        Duration::from_secs(5),
        wait_until(&engine, |state| {
            version_of(state, &key3) == 2 && version_of(state, &key_list) == 2
        }),
    )
    .await
    .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_id_invalidation_skips_bare_provider() {
    let versions = Arc::new(Mutex::new(HashMap::new()));
    let engine = CacheEngine::builder(post_api(), versioned_transport(versions)).spawn();

    let mut list = engine.query("getPosts", Value::Null).await.unwrap();
    list.result().await.unwrap();

    let mut update = engine.mutate("updatePost", json!({"id": "3"})).await.unwrap();
    update.result().await.unwrap();

    // Give any (incorrect) refetch time to land.
    sleep(Duration::from_millis(200)).await;
    let key_list = default_cache_key("getPosts", &Value::Null);
    assert_eq!(version_of(&engine.state(), &key_list), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalidated_key_without_subscribers_is_removed() {
    let versions = Arc::new(Mutex::new(HashMap::new()));
    let engine = CacheEngine::builder(post_api(), versioned_transport(versions)).spawn();

    let mut handle = engine.query("getPost", json!("3")).await.unwrap();
    handle.result().await.unwrap();
    handle.unsubscribe();

    let key3 = default_cache_key("getPost", &json!("3"));
    timeout(
        Duration::from_secs(5),
        wait_until(&engine, |state| state.subscriber_count(&key3) == 0),
    )
    .await
    .unwrap();

    let mut update = engine.mutate("updatePost", json!({"id": "3"})).await.unwrap();
    update.result().await.unwrap();

    timeout(
        Duration::from_secs(5),
        wait_until(&engine, |state| !state.queries.contains_key(&key3)),
    )
    .await
    .unwrap();
    assert!(engine.state().provided.invalidated_by(&Tag::with_id("Post", "3")).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_mutation_invalidates_nothing() {
    let versions = Arc::new(Mutex::new(HashMap::new()));
    let transport = {
        let versions = versions.clone();
        let inner = versioned_transport(versions);
        move |request: TransportRequest, ctx: TransportContext| {
            if request.endpoint == "updatePost" {
                return async move { Err::<Value, _>(json!({"status": 500})) }.boxed();
            }
            inner.call(request, ctx)
        }
    };
    let engine = CacheEngine::builder(post_api(), transport).spawn();

    let mut handle = engine.query("getPost", json!("3")).await.unwrap();
    handle.result().await.unwrap();

    let mut update = engine.mutate("updatePost", json!({"id": "3"})).await.unwrap();
    let err = update.result().await.unwrap_err();
    assert_eq!(err, QueryError::Transport(json!({"status": 500})));

    sleep(Duration::from_millis(200)).await;
    let key3 = default_cache_key("getPost", &json!("3"));
    assert_eq!(version_of(&engine.state(), &key3), 1);
}
