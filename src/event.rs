//! The closed union of lifecycle events.
//!
//! Every state transition in the cache is one of these events, applied by
//! the [reducer](crate::reducer) inside the engine's serialized pipeline.
//! The enum is matched exhaustively, so adding a variant forces every
//! consumer to handle it.

use std::sync::Arc;

use serde_json::Value;

use crate::endpoint::Tag;
use crate::error::QueryError;
use crate::key::CacheKey;
use crate::patch::Patch;
use crate::state::{CacheConfig, RequestId, SubscriberId, SubscriptionOptions};

/// Why a query or mutation dispatch rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// Short-circuited by the dedup condition: an equivalent request was
    /// already in flight or freshly fulfilled. Internal bookkeeping only;
    /// never surfaces as a caller-visible error.
    Condition,
    /// Cancelled through the handle's `abort()`.
    Aborted,
    /// The transport collaborator failed; payload stored verbatim.
    Transport(Value),
}

impl Rejection {
    pub const fn is_condition(&self) -> bool {
        matches!(self, Self::Condition)
    }

    /// The caller-visible error, if any. Condition skips have none.
    pub fn into_error(self) -> Option<QueryError> {
        match self {
            Self::Condition => None,
            Self::Aborted => Some(QueryError::Aborted),
            Self::Transport(payload) => Some(QueryError::Transport(payload)),
        }
    }
}

/// A subscriber joining a cache key as part of a dispatch.
pub type Subscribe = Option<(SubscriberId, SubscriptionOptions)>;

/// One committed transition of the cache tree.
#[derive(Debug, Clone)]
pub enum Event {
    /// A query dispatch passed the condition and is now in flight.
    QueryPending {
        endpoint: String,
        cache_key: CacheKey,
        args: Value,
        request_id: RequestId,
        started_at: u64,
        subscribe: Subscribe,
    },
    /// The transport resolved for `request_id`. Ignored by the reducer
    /// unless that request still owns the record (fencing).
    QueryFulfilled {
        cache_key: CacheKey,
        request_id: RequestId,
        data: Arc<Value>,
        provided: Vec<Tag>,
        fulfilled_at: u64,
    },
    /// The dispatch rejected. Condition-flavored rejections with a
    /// subscriber attach that subscriber to the in-flight record instead
    /// of failing anything.
    QueryRejected {
        cache_key: CacheKey,
        request_id: RequestId,
        rejection: Rejection,
        subscribe: Subscribe,
    },
    /// A tracked mutation is in flight.
    MutationPending {
        endpoint: String,
        request_id: RequestId,
        started_at: u64,
    },
    /// A mutation resolved. `invalidated` drives the middleware sweep even
    /// when the mutation itself is untracked.
    MutationFulfilled {
        request_id: RequestId,
        data: Arc<Value>,
        invalidated: Vec<Tag>,
        fulfilled_at: u64,
        tracked: bool,
    },
    MutationRejected {
        request_id: RequestId,
        rejection: Rejection,
        tracked: bool,
    },
    /// A subscriber left its cache key.
    Unsubscribed {
        cache_key: CacheKey,
        subscriber_id: SubscriberId,
    },
    SubscriptionOptionsUpdated {
        cache_key: CacheKey,
        subscriber_id: SubscriberId,
        options: SubscriptionOptions,
    },
    /// Optimistic or manual patches against cached data.
    QueryPatched {
        cache_key: CacheKey,
        patches: Vec<Patch>,
    },
    /// Garbage collection or invalidation removing a whole record together
    /// with its subscribers and tag-index entries.
    RemoveQueryResult { cache_key: CacheKey },
    RemoveMutationResult { request_id: RequestId },
    OnlineChanged(bool),
    FocusChanged(bool),
    ConfigUpdated(CacheConfig),
}
