//! # Requery - In-Process Data-Fetching Cache
//!
//! Requery is a client-side cache for remote data, built around named
//! endpoints instead of ad-hoc request code. Query results are cached by
//! endpoint and arguments, duplicate in-flight requests are collapsed into
//! one, and mutations invalidate cached reads through declarative tags.
//!
//! ## Architecture
//!
//! The engine is a single-writer event pipeline:
//!
//! 1. **Api**: Named [`Endpoint`](endpoint::Endpoint) definitions with their
//!    provided/invalidated [`Tag`](endpoint::Tag)s
//! 2. **Events**: Every cache transition is an [`Event`](event::Event)
//! 3. **Reducer**: A pure function folding events into the
//!    [`CacheState`](state::CacheState) tree
//! 4. **Scheduler**: Turns committed transitions into side effects — tag
//!    invalidation, polling timers, garbage collection, connectivity sweeps
//! 5. **Transport**: The pluggable collaborator that actually performs
//!    requests
//!
//! Readers observe the tree through cheap [`Arc`](std::sync::Arc) snapshots;
//! unchanged records keep their allocation across snapshots, so consumers
//! can use pointer identity to skip redundant work.
//!
//! ## Example
//!
//! ```rust,no_run
//! use requery::prelude::*;
//! use serde_json::json;
//!
//! # async fn example(transport: impl Transport) -> Result<(), Box<dyn std::error::Error>> {
//! let api = Api::new()
//!     .endpoint(Endpoint::query("getPost").provides_fn(|result, _args| {
//!         vec![Tag::with_id("Post", result["id"].as_str().unwrap_or(""))]
//!     }))
//!     .endpoint(Endpoint::mutation("updatePost").invalidates_fn(|_result, args| {
//!         vec![Tag::with_id("Post", args["id"].as_str().unwrap_or(""))]
//!     }));
//!
//! let engine = CacheEngine::builder(api, transport).spawn();
//!
//! let mut post = engine.query("getPost", json!("3")).await?;
//! let data = post.result().await?;
//!
//! // A successful mutation invalidates Post/3, refetching the query above.
//! engine.mutate("updatePost", json!({"id": "3", "title": "new"})).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Design Inspiration
//!
//! The endpoint/tag model follows
//! [RTK Query](https://redux-toolkit.js.org/rtk-query/overview), adapted to
//! an in-process async engine.

pub mod endpoint;
pub mod engine;
pub mod error;
pub mod event;
pub mod key;
pub mod patch;
pub mod prelude;
pub mod reducer;
mod scheduler;
pub mod state;
pub mod transport;
