//! The cache tree: query and mutation records, the tag index, the
//! subscriber registry, configuration, and connectivity flags.
//!
//! The whole tree is a plain value. It is owned and mutated exclusively by
//! the engine's serialized pipeline (via the [reducer](crate::reducer)) and
//! published to readers as immutable [`Arc`] snapshots. Everything here is
//! serializable, so a snapshot can be persisted, inspected, or fed to
//! devtools as JSON.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::endpoint::Tag;
use crate::error::QueryError;
use crate::key::CacheKey;

/// Identifies one dispatch of a query or mutation.
///
/// Request ids are allocated monotonically by the pipeline, which is what
/// makes the fencing invariant checkable: a record only accepts completions
/// from the request that currently owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub(crate) u64);

/// Identifies one subscriber's interest in a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(pub(crate) u64);

/// Lifecycle status shared by query and mutation records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QueryStatus {
    #[default]
    Uninitialized,
    Pending,
    Fulfilled,
    Rejected,
}

/// Cached state for one cache key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub endpoint: String,
    pub status: QueryStatus,
    pub original_args: Value,
    /// The request that currently owns this record. Completions from any
    /// other request id are superseded and must be dropped.
    pub request_id: RequestId,
    /// Last known good result. Retained across refetches so consumers keep
    /// seeing data while a revalidation is pending or has failed.
    pub data: Option<Arc<Value>>,
    pub error: Option<QueryError>,
    pub started_at: u64,
    pub fulfilled_at: Option<u64>,
}

/// State for one tracked mutation, keyed by request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationRecord {
    pub endpoint: String,
    pub status: QueryStatus,
    pub data: Option<Arc<Value>>,
    pub error: Option<QueryError>,
    pub started_at: u64,
    pub fulfilled_at: Option<u64>,
}

/// One subscriber's refetch preferences for a cache key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    /// Poll this key at the given interval. The key's effective interval is
    /// the minimum over all subscribers that set one.
    pub polling_interval: Option<Duration>,
    /// Explicit opt-in (`Some(true)`) or opt-out (`Some(false)`) for the
    /// focus sweep; `None` defers to the global default.
    pub refetch_on_focus: Option<bool>,
    /// As above, for the reconnect sweep.
    pub refetch_on_reconnect: Option<bool>,
}

/// Per-type buckets of the tag index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagBucket {
    /// Keys that provided the bare type tag (no id).
    pub wildcard: HashSet<CacheKey>,
    /// Keys that provided the type scoped to a specific id.
    pub ids: HashMap<String, HashSet<CacheKey>>,
}

impl TagBucket {
    fn is_empty(&self) -> bool {
        self.wildcard.is_empty() && self.ids.is_empty()
    }
}

/// Maps provided tags to the cache keys that provided them on their last
/// fulfillment. Invariant: every referenced key has a live [`QueryRecord`];
/// both are pruned together when a record is removed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagIndex {
    buckets: HashMap<String, TagBucket>,
}

impl TagIndex {
    pub fn insert(&mut self, tag: &Tag, key: &CacheKey) {
        let bucket = self.buckets.entry(tag.kind.clone()).or_default();
        match &tag.id {
            Some(id) => {
                bucket.ids.entry(id.clone()).or_default().insert(key.clone());
            }
            None => {
                bucket.wildcard.insert(key.clone());
            }
        }
    }

    /// Removes `key` from every bucket, dropping buckets that become empty.
    pub fn remove_key(&mut self, key: &CacheKey) {
        self.buckets.retain(|_, bucket| {
            bucket.wildcard.remove(key);
            bucket.ids.retain(|_, keys| {
                keys.remove(key);
                !keys.is_empty()
            });
            !bucket.is_empty()
        });
    }

    /// The cache keys an invalidation of `tag` affects.
    ///
    /// An id-scoped tag hits exactly that id's bucket. A bare type tag is a
    /// wildcard: it hits the union of every bucket of the type, including
    /// keys that provided the bare tag themselves. Keys that provided only
    /// the bare tag are never matched by an id-scoped invalidation.
    pub fn invalidated_by(&self, tag: &Tag) -> HashSet<CacheKey> {
        let Some(bucket) = self.buckets.get(&tag.kind) else {
            return HashSet::new();
        };
        match &tag.id {
            Some(id) => bucket.ids.get(id).cloned().unwrap_or_default(),
            None => {
                let mut keys = bucket.wildcard.clone();
                for id_keys in bucket.ids.values() {
                    keys.extend(id_keys.iter().cloned());
                }
                keys
            }
        }
    }

    /// The tags `key` currently provides, for tests and diagnostics.
    pub fn tags_of(&self, key: &CacheKey) -> Vec<Tag> {
        let mut tags = Vec::new();
        for (kind, bucket) in &self.buckets {
            if bucket.wildcard.contains(key) {
                tags.push(Tag::of(kind.clone()));
            }
            for (id, keys) in &bucket.ids {
                if keys.contains(key) {
                    tags.push(Tag::with_id(kind.clone(), id));
                }
            }
        }
        tags
    }
}

/// Global cache behavior defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Grace period a record survives after its last subscriber leaves.
    pub keep_unused_data_for: Duration,
    /// When set, a subscribing dispatch bypasses the dedup condition even
    /// if the record is already fulfilled.
    pub refetch_on_mount_or_arg_change: bool,
    /// Default for subscribers that did not set `refetch_on_focus`.
    pub refetch_on_focus: bool,
    /// Default for subscribers that did not set `refetch_on_reconnect`.
    pub refetch_on_reconnect: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            keep_unused_data_for: Duration::from_secs(60),
            refetch_on_mount_or_arg_change: false,
            refetch_on_focus: false,
            refetch_on_reconnect: false,
        }
    }
}

/// The complete cache tree. See the module docs for the ownership rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheState {
    pub queries: HashMap<CacheKey, QueryRecord>,
    pub mutations: HashMap<RequestId, MutationRecord>,
    pub provided: TagIndex,
    pub subscriptions: HashMap<CacheKey, HashMap<SubscriberId, SubscriptionOptions>>,
    pub config: CacheConfig,
    pub online: bool,
    pub focused: bool,
}

impl CacheState {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            queries: HashMap::new(),
            mutations: HashMap::new(),
            provided: TagIndex::default(),
            subscriptions: HashMap::new(),
            config,
            online: true,
            focused: true,
        }
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.subscriptions.get(key).map_or(0, HashMap::len)
    }

    /// A read-only view of the record at `key`, defaulting to an
    /// uninitialized snapshot when no record exists.
    pub fn query_by_key(&self, key: &CacheKey) -> QuerySnapshot {
        match self.queries.get(key) {
            Some(record) => QuerySnapshot {
                status: record.status,
                data: record.data.clone(),
                error: record.error.clone(),
                original_args: Some(record.original_args.clone()),
                request_id: Some(record.request_id),
                started_at: Some(record.started_at),
                fulfilled_at: record.fulfilled_at,
            },
            None => QuerySnapshot::default(),
        }
    }

    /// A read-only view of the tracked mutation with `request_id`.
    pub fn mutation(&self, request_id: RequestId) -> MutationSnapshot {
        match self.mutations.get(&request_id) {
            Some(record) => MutationSnapshot {
                status: record.status,
                data: record.data.clone(),
                error: record.error.clone(),
                started_at: Some(record.started_at),
                fulfilled_at: record.fulfilled_at,
            },
            None => MutationSnapshot::default(),
        }
    }

    /// The effective polling interval for `key`: the minimum over its
    /// subscribers that set a non-zero one.
    pub(crate) fn min_polling_interval(&self, key: &CacheKey) -> Option<Duration> {
        self.subscriptions
            .get(key)?
            .values()
            .filter_map(|options| options.polling_interval)
            .filter(|interval| !interval.is_zero())
            .min()
    }
}

impl Default for CacheState {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

/// Derived view of a query record.
///
/// `data` is an [`Arc`] clone of the record's payload: as long as the
/// underlying data is unchanged, repeated snapshots hand out the same
/// allocation, so consumers can use pointer identity to skip work.
#[derive(Debug, Clone, Default)]
pub struct QuerySnapshot {
    pub status: QueryStatus,
    pub data: Option<Arc<Value>>,
    pub error: Option<QueryError>,
    pub original_args: Option<Value>,
    pub request_id: Option<RequestId>,
    pub started_at: Option<u64>,
    pub fulfilled_at: Option<u64>,
}

impl QuerySnapshot {
    pub const fn is_uninitialized(&self) -> bool {
        matches!(self.status, QueryStatus::Uninitialized)
    }

    pub const fn is_loading(&self) -> bool {
        matches!(self.status, QueryStatus::Pending)
    }

    pub const fn is_success(&self) -> bool {
        matches!(self.status, QueryStatus::Fulfilled)
    }

    pub const fn is_error(&self) -> bool {
        matches!(self.status, QueryStatus::Rejected)
    }
}

/// Derived view of a mutation record.
#[derive(Debug, Clone, Default)]
pub struct MutationSnapshot {
    pub status: QueryStatus,
    pub data: Option<Arc<Value>>,
    pub error: Option<QueryError>,
    pub started_at: Option<u64>,
    pub fulfilled_at: Option<u64>,
}

impl MutationSnapshot {
    pub const fn is_uninitialized(&self) -> bool {
        matches!(self.status, QueryStatus::Uninitialized)
    }

    pub const fn is_loading(&self) -> bool {
        matches!(self.status, QueryStatus::Pending)
    }

    pub const fn is_success(&self) -> bool {
        matches!(self.status, QueryStatus::Fulfilled)
    }

    pub const fn is_error(&self) -> bool {
        matches!(self.status, QueryStatus::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::default_cache_key;
    use serde_json::json;

    fn key(n: &str) -> CacheKey {
        default_cache_key("getPost", &json!(n))
    }

    #[test]
    fn test_tag_index_id_scoped_lookup() {
        let mut index = TagIndex::default();
        index.insert(&Tag::with_id("Post", "3"), &key("3"));
        index.insert(&Tag::with_id("Post", "4"), &key("4"));

        let hit = index.invalidated_by(&Tag::with_id("Post", "3"));
        assert!(hit.contains(&key("3")));
        assert!(!hit.contains(&key("4")));
    }

    #[test]
    fn test_tag_index_wildcard_hits_all_ids() {
        let mut index = TagIndex::default();
        index.insert(&Tag::with_id("Post", "3"), &key("3"));
        index.insert(&Tag::with_id("Post", "4"), &key("4"));
        index.insert(&Tag::of("Post"), &key("list"));

        let hit = index.invalidated_by(&Tag::of("Post"));
        assert_eq!(hit.len(), 3);
    }

    #[test]
    fn test_bare_provider_not_hit_by_id_invalidation() {
        let mut index = TagIndex::default();
        index.insert(&Tag::of("Post"), &key("list"));

        assert!(index.invalidated_by(&Tag::with_id("Post", "3")).is_empty());
    }

    #[test]
    fn test_remove_key_prunes_buckets() {
        let mut index = TagIndex::default();
        index.insert(&Tag::with_id("Post", "3"), &key("3"));
        index.insert(&Tag::of("Post"), &key("3"));

        index.remove_key(&key("3"));
        assert!(index.invalidated_by(&Tag::of("Post")).is_empty());
        assert!(index.tags_of(&key("3")).is_empty());
    }

    #[test]
    fn test_min_polling_interval_ignores_zero() {
        let mut state = CacheState::default();
        let k = key("3");
        let subs = state.subscriptions.entry(k.clone()).or_default();
        subs.insert(
            SubscriberId(1),
            SubscriptionOptions {
                polling_interval: Some(Duration::from_millis(500)),
                ..Default::default()
            },
        );
        subs.insert(
            SubscriberId(2),
            SubscriptionOptions {
                polling_interval: Some(Duration::from_millis(200)),
                ..Default::default()
            },
        );
        subs.insert(
            SubscriberId(3),
            SubscriptionOptions {
                polling_interval: Some(Duration::ZERO),
                ..Default::default()
            },
        );

        assert_eq!(state.min_polling_interval(&k), Some(Duration::from_millis(200)));
    }

    #[test]
    fn test_state_serializes_to_json() {
        let mut state = CacheState::default();
        state.queries.insert(
            key("3"),
            QueryRecord {
                endpoint: "getPost".into(),
                status: QueryStatus::Fulfilled,
                original_args: json!("3"),
                request_id: RequestId(1),
                data: Some(Arc::new(json!({"id": "3"}))),
                error: None,
                started_at: 10,
                fulfilled_at: Some(20),
            },
        );
        state.provided.insert(&Tag::with_id("Post", "3"), &key("3"));

        let rendered = serde_json::to_value(&state).expect("state is JSON-representable");
        assert!(rendered.get("queries").is_some());
        assert!(rendered.get("provided").is_some());
        assert!(rendered.get("subscriptions").is_some());
        assert!(rendered.get("config").is_some());
    }
}
