//! Posts example demonstrating queries, mutations, and cache invalidation.
//!
//! This example shows:
//! - Query dispatch with automatic caching and request dedup
//! - A mutation invalidating the tags its target queries provide
//! - An optimistic update rolled forward by the confirming refetch
//!
//! The "server" is an in-memory transport with a small artificial latency.
//!
//! Run with: `cargo run --example posts`

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use requery::prelude::*;
use serde_json::{Value, json};
use tokio::time::{Duration, sleep};

fn api() -> Api {
    Api::new()
        .endpoint(Endpoint::query("getPost").provides_fn(|_result, args| {
            vec![Tag::with_id("Post", args.as_str().unwrap_or(""))]
        }))
        .endpoint(Endpoint::query("getPosts").provides([Tag::of("Post")]))
        .endpoint(Endpoint::mutation("updatePost").invalidates_fn(|_result, args| {
            vec![Tag::with_id("Post", args["id"].as_str().unwrap_or(""))]
        }))
}

/// In-memory post store standing in for a remote backend.
fn server() -> impl Transport {
    let posts: Arc<Mutex<HashMap<String, Value>>> = Arc::new(Mutex::new(HashMap::from([
        ("1".to_owned(), json!({"id": "1", "title": "Hello"})),
        ("2".to_owned(), json!({"id": "2", "title": "World"})),
    ])));

    move |request: TransportRequest, _ctx: TransportContext| {
        let posts = posts.clone();
        async move {
            sleep(Duration::from_millis(50)).await;
            match request.endpoint.as_str() {
                "getPost" => {
                    let id = request.args.as_str().unwrap_or("");
                    posts
                        .lock()
                        .unwrap()
                        .get(id)
                        .cloned()
                        .ok_or_else(|| json!({"status": 404}))
                }
                "getPosts" => {
                    let mut all: Vec<Value> = posts.lock().unwrap().values().cloned().collect();
                    all.sort_by_key(|post| post["id"].as_str().unwrap_or("").to_owned());
                    Ok(Value::Array(all))
                }
                "updatePost" => {
                    let id = request.args["id"].as_str().unwrap_or("").to_owned();
                    let mut posts = posts.lock().unwrap();
                    match posts.get_mut(&id) {
                        Some(post) => {
                            post["title"] = request.args["title"].clone();
                            Ok(post.clone())
                        }
                        None => Err(json!({"status": 404})),
                    }
                }
                other => Err(json!({"status": 400, "detail": format!("unknown endpoint {other}")})),
            }
        }
        .boxed()
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let engine = CacheEngine::builder(api(), server()).spawn();

    // First fetch goes to the transport; the second is served from cache.
    let mut post = engine.query("getPost", json!("1")).await?;
    println!("fetched:  {}", post.result().await?);
    let mut again = engine.query("getPost", json!("1")).await?;
    println!("cached:   {}", again.result().await?);

    // Optimistically retitle, then confirm with the real mutation. The
    // invalidation of Post/1 refetches getPost("1") behind the scenes.
    let patches = engine
        .update_query_result("getPost", &json!("1"), |data| {
            data["title"] = json!("Hello, requery");
        })
        .await?;
    println!("optimistic: {}", engine.select_query("getPost", &json!("1")).data.unwrap());

    let mut update = engine
        .mutate("updatePost", json!({"id": "1", "title": "Hello, requery"}))
        .await?;
    if update.result().await.is_err() {
        // Roll the optimistic edit back on failure.
        engine.patch_query_result("getPost", &json!("1"), patches.inverse.clone())?;
    }

    // Wait for the invalidation-driven refetch to land.
    let mut snapshots = engine.watch_state();
    loop {
        let snapshot = engine.select_query("getPost", &json!("1"));
        if snapshot.is_success() && snapshot.data.as_deref() == Some(&json!({"id": "1", "title": "Hello, requery"})) {
            println!("confirmed: {}", snapshot.data.unwrap());
            break;
        }
        snapshots.changed().await?;
    }

    Ok(())
}
