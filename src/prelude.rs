//! Prelude module for convenient imports.
//!
//! ```
//! use requery::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`Api`], [`Endpoint`], [`Tag`] - Declaring endpoints and their tags
//! - [`CacheEngine`], [`QueryOptions`] - Dispatching queries and mutations
//! - [`QueryHandle`], [`MutationHandle`] - Observing and controlling requests
//! - [`Transport`] - The request collaborator contract
//! - [`CacheConfig`], [`SubscriptionOptions`] - Tuning cache behavior

pub use crate::endpoint::{Api, Endpoint, EndpointKind, Tag};
pub use crate::engine::{
    CacheEngine, EngineBuilder, MutationHandle, QueryHandle, QueryOptions, QueryOutcome,
};
pub use crate::error::{EngineError, QueryError};
pub use crate::key::{CacheKey, default_cache_key};
pub use crate::patch::{Patch, PatchSet};
pub use crate::state::{
    CacheConfig, CacheState, MutationSnapshot, QueryRecord, QuerySnapshot, QueryStatus,
    RequestId, SubscriptionOptions,
};
pub use crate::transport::{Transport, TransportContext, TransportOutcome, TransportRequest};
