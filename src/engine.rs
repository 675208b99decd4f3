//! The cache engine: a serialized event pipeline plus the request initiator.
//!
//! All state lives in one [`CacheState`] value owned by a single pipeline
//! task. Callers talk to it through [`CacheEngine`], which sends operations
//! over an unbounded channel; the pipeline fully processes one operation
//! before the next, so observable state stays totally ordered without
//! locks. Transport calls and timers run concurrently, but only their
//! completions re-enter the pipeline.
//!
//! # Example
//!
//! ```rust,ignore
//! use requery::prelude::*;
//! use serde_json::json;
//!
//! let api = Api::new()
//!     .endpoint(Endpoint::query("getPost").provides_fn(|result, _| {
//!         vec![Tag::with_id("Post", result["id"].as_str().unwrap_or(""))]
//!     }))
//!     .endpoint(Endpoint::mutation("updatePost").invalidates_fn(|_, args| {
//!         vec![Tag::with_id("Post", args["id"].as_str().unwrap_or(""))]
//!     }));
//!
//! let engine = CacheEngine::builder(api, transport).spawn();
//! let mut handle = engine.query("getPost", json!("3")).await?;
//! let post = handle.result().await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::endpoint::{Api, EndpointKind};
use crate::error::{EngineError, QueryError};
use crate::event::{Event, Rejection, Subscribe};
use crate::key::{CacheKey, KeySerializer, default_cache_key};
use crate::patch::{self, Patch, PatchSet};
use crate::reducer;
use crate::scheduler::Scheduler;
use crate::state::{
    CacheConfig, CacheState, MutationSnapshot, QuerySnapshot, QueryStatus, RequestId,
    SubscriberId, SubscriptionOptions,
};
use crate::transport::{Transport, TransportContext, TransportRequest};

/// How a query or mutation resolved, as seen through a handle.
pub type QueryOutcome = Result<Arc<Value>, QueryError>;

/// Per-dispatch options for [`CacheEngine::query_with`].
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Register the caller as a subscriber of the cache key.
    pub subscribe: bool,
    /// Bypass the dedup condition, superseding any in-flight request.
    pub force_refetch: bool,
    /// The caller's polling and refetch preferences.
    pub subscription_options: SubscriptionOptions,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            subscribe: true,
            force_refetch: false,
            subscription_options: SubscriptionOptions::default(),
        }
    }
}

/// Pipeline operations. Lifecycle events are wrapped in [`Op::Apply`];
/// the rest are initiator and timer entry points that need to read state
/// inside the serialized step before committing anything.
pub(crate) enum Op {
    StartQuery {
        endpoint: String,
        args: Value,
        options: QueryOptions,
        reply: oneshot::Sender<StartedQuery>,
    },
    StartMutation {
        endpoint: String,
        args: Value,
        track: bool,
        reply: oneshot::Sender<StartedMutation>,
    },
    UpdateResult {
        cache_key: CacheKey,
        recipe: Box<dyn FnOnce(&mut Value) + Send>,
        reply: oneshot::Sender<PatchSet>,
    },
    Refetch {
        cache_key: CacheKey,
    },
    GcExpired {
        cache_key: CacheKey,
    },
    Apply(Event),
}

pub(crate) struct StartedQuery {
    request_id: RequestId,
    cache_key: CacheKey,
    subscriber_id: Option<SubscriberId>,
    token: CancellationToken,
    outcome: oneshot::Receiver<QueryOutcome>,
}

pub(crate) struct StartedMutation {
    request_id: RequestId,
    token: CancellationToken,
    outcome: oneshot::Receiver<QueryOutcome>,
}

struct Shared {
    api: Arc<Api>,
    serialize_key: KeySerializer,
    shutdown: CancellationToken,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Last engine clone gone: stop the pipeline task.
        self.shutdown.cancel();
    }
}

/// Configures and spawns a [`CacheEngine`].
pub struct EngineBuilder {
    api: Api,
    transport: Arc<dyn Transport>,
    config: CacheConfig,
    serialize_key: KeySerializer,
}

impl EngineBuilder {
    #[must_use]
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the default cache-key deriver.
    #[must_use]
    pub fn key_serializer(
        mut self,
        serialize: impl Fn(&str, &Value) -> CacheKey + Send + Sync + 'static,
    ) -> Self {
        self.serialize_key = Arc::new(serialize);
        self
    }

    /// Spawns the pipeline task on the current tokio runtime.
    pub fn spawn(self) -> CacheEngine {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) =
            watch::channel(Arc::new(CacheState::new(self.config.clone())));
        let shutdown = CancellationToken::new();

        let shared = Arc::new(Shared {
            api: Arc::new(self.api),
            serialize_key: self.serialize_key.clone(),
            shutdown: shutdown.clone(),
        });

        let pipeline = Pipeline {
            state: CacheState::new(self.config),
            api: shared.api.clone(),
            transport: self.transport,
            serialize_key: self.serialize_key,
            tx: tx.clone(),
            rx,
            snapshots: snapshot_tx,
            scheduler: Scheduler::new(tx.clone()),
            waiters: HashMap::new(),
            inflight: HashMap::new(),
            next_id: 0,
        };
        tokio::spawn(pipeline.run(shutdown));

        CacheEngine {
            tx,
            snapshots: snapshot_rx,
            shared,
        }
    }
}

/// The injected dispatch/getState capability pair, made concrete: an event
/// sender plus watch-published state snapshots. Cloning is cheap; the
/// pipeline stops once the last clone (and the last handle) is dropped.
#[derive(Clone)]
pub struct CacheEngine {
    tx: mpsc::UnboundedSender<Op>,
    snapshots: watch::Receiver<Arc<CacheState>>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine").finish_non_exhaustive()
    }
}

impl CacheEngine {
    pub fn builder(api: Api, transport: impl Transport) -> EngineBuilder {
        EngineBuilder {
            api,
            transport: Arc::new(transport),
            config: CacheConfig::default(),
            serialize_key: Arc::new(default_cache_key),
        }
    }

    /// Starts (or joins) a query with default options: subscribed, not forced.
    pub async fn query(&self, endpoint: &str, args: Value) -> Result<QueryHandle, EngineError> {
        self.query_with(endpoint, args, QueryOptions::default()).await
    }

    /// Starts a query, applying the dedup condition first: when an
    /// equivalent request is in flight or freshly fulfilled and
    /// `force_refetch` is off, no transport call happens and the returned
    /// handle follows the existing request instead.
    pub async fn query_with(
        &self,
        endpoint: &str,
        args: Value,
        options: QueryOptions,
    ) -> Result<QueryHandle, EngineError> {
        let definition = self
            .shared
            .api
            .get(endpoint)
            .ok_or_else(|| EngineError::UnknownEndpoint(endpoint.to_owned()))?;
        if definition.kind() != EndpointKind::Query {
            return Err(EngineError::NotAQuery(endpoint.to_owned()));
        }

        let (reply, ack) = oneshot::channel();
        self.tx
            .send(Op::StartQuery {
                endpoint: endpoint.to_owned(),
                args,
                options,
                reply,
            })
            .map_err(|_| EngineError::Closed)?;
        let started = ack.await.map_err(|_| EngineError::Closed)?;

        Ok(QueryHandle {
            engine: self.clone(),
            cache_key: started.cache_key,
            request_id: started.request_id,
            subscriber_id: started.subscriber_id,
            token: started.token,
            outcome: Some(started.outcome),
            resolved: None,
        })
    }

    /// Runs a tracked mutation. Mutations never dedup: every call executes.
    pub async fn mutate(&self, endpoint: &str, args: Value) -> Result<MutationHandle, EngineError> {
        self.mutate_with(endpoint, args, true).await
    }

    /// Runs a mutation; with `track` off, no [`MutationRecord`] is kept and
    /// only the handle observes the outcome.
    ///
    /// [`MutationRecord`]: crate::state::MutationRecord
    pub async fn mutate_with(
        &self,
        endpoint: &str,
        args: Value,
        track: bool,
    ) -> Result<MutationHandle, EngineError> {
        let definition = self
            .shared
            .api
            .get(endpoint)
            .ok_or_else(|| EngineError::UnknownEndpoint(endpoint.to_owned()))?;
        if definition.kind() != EndpointKind::Mutation {
            return Err(EngineError::NotAMutation(endpoint.to_owned()));
        }

        let (reply, ack) = oneshot::channel();
        self.tx
            .send(Op::StartMutation {
                endpoint: endpoint.to_owned(),
                args,
                track,
                reply,
            })
            .map_err(|_| EngineError::Closed)?;
        let started = ack.await.map_err(|_| EngineError::Closed)?;

        Ok(MutationHandle {
            engine: self.clone(),
            request_id: started.request_id,
            token: started.token,
            tracked: track,
            outcome: Some(started.outcome),
            resolved: None,
        })
    }

    /// Runs `recipe` against the cached data for `(endpoint, args)` and
    /// commits the resulting patches. Returns the forward patches together
    /// with the inverse that rolls them back; both are empty when no record
    /// (or no data) matches.
    pub async fn update_query_result(
        &self,
        endpoint: &str,
        args: &Value,
        recipe: impl FnOnce(&mut Value) + Send + 'static,
    ) -> Result<PatchSet, EngineError> {
        let cache_key = self.cache_key_for(endpoint, args)?;
        let (reply, ack) = oneshot::channel();
        self.tx
            .send(Op::UpdateResult {
                cache_key,
                recipe: Box::new(recipe),
                reply,
            })
            .map_err(|_| EngineError::Closed)?;
        ack.await.map_err(|_| EngineError::Closed)
    }

    /// Applies previously computed patches (typically a [`PatchSet`]'s
    /// inverse, to roll an optimistic update back).
    pub fn patch_query_result(
        &self,
        endpoint: &str,
        args: &Value,
        patches: Vec<Patch>,
    ) -> Result<(), EngineError> {
        let cache_key = self.cache_key_for(endpoint, args)?;
        self.tx
            .send(Op::Apply(Event::QueryPatched { cache_key, patches }))
            .map_err(|_| EngineError::Closed)
    }

    /// Connectivity signal from the host environment.
    pub fn set_online(&self, online: bool) {
        let _ = self.tx.send(Op::Apply(Event::OnlineChanged(online)));
    }

    /// Visibility signal from the host environment.
    pub fn set_focused(&self, focused: bool) {
        let _ = self.tx.send(Op::Apply(Event::FocusChanged(focused)));
    }

    pub fn update_config(&self, config: CacheConfig) {
        let _ = self.tx.send(Op::Apply(Event::ConfigUpdated(config)));
    }

    /// The cache tree as of the latest committed transition.
    pub fn state(&self) -> Arc<CacheState> {
        self.snapshots.borrow().clone()
    }

    /// A receiver that yields a fresh snapshot after every transition.
    pub fn watch_state(&self) -> watch::Receiver<Arc<CacheState>> {
        self.snapshots.clone()
    }

    /// Read-only view of a query's record; uninitialized when absent.
    pub fn select_query(&self, endpoint: &str, args: &Value) -> QuerySnapshot {
        match self.cache_key_for(endpoint, args) {
            Ok(cache_key) => self.state().query_by_key(&cache_key),
            Err(_) => QuerySnapshot::default(),
        }
    }

    /// Read-only view of a tracked mutation's record.
    pub fn select_mutation(&self, request_id: RequestId) -> MutationSnapshot {
        self.state().mutation(request_id)
    }

    fn cache_key_for(&self, endpoint: &str, args: &Value) -> Result<CacheKey, EngineError> {
        let definition = self
            .shared
            .api
            .get(endpoint)
            .ok_or_else(|| EngineError::UnknownEndpoint(endpoint.to_owned()))?;
        if definition.kind() != EndpointKind::Query {
            return Err(EngineError::NotAQuery(endpoint.to_owned()));
        }
        Ok((self.shared.serialize_key)(endpoint, args))
    }
}

/// Handle for one query dispatch.
///
/// Dropping the handle does *not* unsubscribe; call
/// [`unsubscribe`](Self::unsubscribe) when the caller's interest ends so
/// garbage collection can reclaim the record.
#[derive(Debug)]
pub struct QueryHandle {
    engine: CacheEngine,
    cache_key: CacheKey,
    request_id: RequestId,
    subscriber_id: Option<SubscriberId>,
    token: CancellationToken,
    outcome: Option<oneshot::Receiver<QueryOutcome>>,
    resolved: Option<QueryOutcome>,
}

impl QueryHandle {
    /// The request that owns the record this handle observes. For a
    /// dedup-skipped dispatch this is the original in-flight request's id.
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub const fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }

    /// Waits for the terminal outcome of the owning request. Repeated calls
    /// return the same result.
    pub async fn result(&mut self) -> QueryOutcome {
        if let Some(resolved) = &self.resolved {
            return resolved.clone();
        }
        let outcome = match self.outcome.take() {
            Some(ack) => ack.await.unwrap_or(Err(QueryError::Aborted)),
            None => Err(QueryError::Aborted),
        };
        self.resolved = Some(outcome.clone());
        outcome
    }

    /// Signals the in-flight transport call to stop. The request still
    /// terminates, as Rejected with [`QueryError::Aborted`].
    pub fn abort(&self) {
        self.token.cancel();
    }

    /// Withdraws this caller's subscription, arming garbage collection once
    /// the key's subscriber count reaches zero.
    pub fn unsubscribe(self) {
        if let Some(subscriber_id) = self.subscriber_id {
            let _ = self.engine.tx.send(Op::Apply(Event::Unsubscribed {
                cache_key: self.cache_key.clone(),
                subscriber_id,
            }));
        }
    }

    /// Forces a refetch of this cache key using its stored arguments,
    /// without registering a new subscriber.
    pub fn refetch(&self) {
        let _ = self.engine.tx.send(Op::Refetch {
            cache_key: self.cache_key.clone(),
        });
    }

    /// Replaces this subscriber's polling and refetch preferences.
    pub fn update_subscription_options(&self, options: SubscriptionOptions) {
        if let Some(subscriber_id) = self.subscriber_id {
            let _ = self
                .engine
                .tx
                .send(Op::Apply(Event::SubscriptionOptionsUpdated {
                    cache_key: self.cache_key.clone(),
                    subscriber_id,
                    options,
                }));
        }
    }
}

/// Handle for one mutation dispatch.
#[derive(Debug)]
pub struct MutationHandle {
    engine: CacheEngine,
    request_id: RequestId,
    token: CancellationToken,
    tracked: bool,
    outcome: Option<oneshot::Receiver<QueryOutcome>>,
    resolved: Option<QueryOutcome>,
}

impl MutationHandle {
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Waits for the terminal outcome. Repeated calls return the same result.
    pub async fn result(&mut self) -> QueryOutcome {
        if let Some(resolved) = &self.resolved {
            return resolved.clone();
        }
        let outcome = match self.outcome.take() {
            Some(ack) => ack.await.unwrap_or(Err(QueryError::Aborted)),
            None => Err(QueryError::Aborted),
        };
        self.resolved = Some(outcome.clone());
        outcome
    }

    pub fn abort(&self) {
        self.token.cancel();
    }

    /// Drops the tracked [`MutationRecord`](crate::state::MutationRecord).
    pub fn unsubscribe(self) {
        if self.tracked {
            let _ = self.engine.tx.send(Op::Apply(Event::RemoveMutationResult {
                request_id: self.request_id,
            }));
        }
    }
}

/// The single-writer task that owns the cache tree.
struct Pipeline {
    state: CacheState,
    api: Arc<Api>,
    transport: Arc<dyn Transport>,
    serialize_key: KeySerializer,
    tx: mpsc::UnboundedSender<Op>,
    rx: mpsc::UnboundedReceiver<Op>,
    snapshots: watch::Sender<Arc<CacheState>>,
    scheduler: Scheduler,
    /// Handles waiting for a request's terminal event, keyed by the owning
    /// request id. Dedup-skipped dispatches wait under the in-flight id.
    waiters: HashMap<RequestId, Vec<oneshot::Sender<QueryOutcome>>>,
    /// The in-flight request per cache key, for dedup-joined aborts and
    /// cleanup on completion.
    inflight: HashMap<CacheKey, (RequestId, CancellationToken)>,
    next_id: u64,
}

impl Pipeline {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                op = self.rx.recv() => match op {
                    Some(op) => self.handle(op),
                    None => break,
                },
            }
        }
        self.scheduler.shutdown();
    }

    fn handle(&mut self, op: Op) {
        match op {
            Op::StartQuery {
                endpoint,
                args,
                options,
                reply,
            } => self.start_query(endpoint, args, options, reply),
            Op::StartMutation {
                endpoint,
                args,
                track,
                reply,
            } => self.start_mutation(endpoint, args, track, reply),
            Op::UpdateResult {
                cache_key,
                recipe,
                reply,
            } => self.update_result(cache_key, recipe, reply),
            Op::Refetch { cache_key } => self.refetch(cache_key),
            Op::GcExpired { cache_key } => self.gc_expired(cache_key),
            Op::Apply(event) => self.commit(event),
        }
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn start_query(
        &mut self,
        endpoint: String,
        args: Value,
        options: QueryOptions,
        reply: oneshot::Sender<StartedQuery>,
    ) {
        let cache_key = (self.serialize_key)(&endpoint, &args);
        let force = options.force_refetch
            || (options.subscribe && self.state.config.refetch_on_mount_or_arg_change);
        let status = self.state.queries.get(&cache_key).map(|r| r.status);
        let skip = !force && matches!(status, Some(QueryStatus::Pending | QueryStatus::Fulfilled));

        let subscriber: Subscribe = if options.subscribe {
            Some((SubscriberId(self.alloc_id()), options.subscription_options))
        } else {
            None
        };

        let started = if skip {
            let (owning, status, data) = {
                let record = &self.state.queries[&cache_key];
                (record.request_id, record.status, record.data.clone())
            };
            trace!(cache_key = %cache_key, owner = owning.0, "dedup condition skipped dispatch");

            let (outcome_tx, outcome_rx) = oneshot::channel();
            let token = if status == QueryStatus::Pending {
                // Joining callers share the in-flight request's abort signal.
                self.inflight
                    .get(&cache_key)
                    .map(|(_, token)| token.clone())
                    .unwrap_or_default()
            } else {
                CancellationToken::new()
            };
            if status == QueryStatus::Fulfilled {
                let _ = outcome_tx.send(Ok(data.unwrap_or_else(|| Arc::new(Value::Null))));
            } else {
                self.waiters.entry(owning).or_default().push(outcome_tx);
            }

            let rejected_id = RequestId(self.alloc_id());
            self.commit(Event::QueryRejected {
                cache_key: cache_key.clone(),
                request_id: rejected_id,
                rejection: Rejection::Condition,
                subscribe: subscriber,
            });

            StartedQuery {
                request_id: owning,
                cache_key,
                subscriber_id: subscriber.map(|(id, _)| id),
                token,
                outcome: outcome_rx,
            }
        } else {
            let (request_id, token, outcome_rx) =
                self.begin_fetch(endpoint, args, cache_key.clone(), subscriber);
            StartedQuery {
                request_id,
                cache_key,
                subscriber_id: subscriber.map(|(id, _)| id),
                token,
                outcome: outcome_rx,
            }
        };
        let _ = reply.send(started);
    }

    /// Commits a pending transition and spawns the transport call. The new
    /// request takes ownership of the record; any previous in-flight call
    /// keeps running but its completion will be fenced out.
    fn begin_fetch(
        &mut self,
        endpoint: String,
        args: Value,
        cache_key: CacheKey,
        subscriber: Subscribe,
    ) -> (RequestId, CancellationToken, oneshot::Receiver<QueryOutcome>) {
        let request_id = RequestId(self.alloc_id());
        let token = CancellationToken::new();
        self.inflight
            .insert(cache_key.clone(), (request_id, token.clone()));

        let (outcome_tx, outcome_rx) = oneshot::channel();
        self.waiters.entry(request_id).or_default().push(outcome_tx);

        self.commit(Event::QueryPending {
            endpoint: endpoint.clone(),
            cache_key: cache_key.clone(),
            args: args.clone(),
            request_id,
            started_at: epoch_ms(),
            subscribe: subscriber,
        });

        let transport = self.transport.clone();
        let api = self.api.clone();
        let tx = self.tx.clone();
        let snapshots = self.snapshots.subscribe();
        let task_token = token.clone();
        tokio::spawn(async move {
            let ctx = TransportContext::new(task_token.clone(), snapshots);
            let result = tokio::select! {
                () = task_token.cancelled() => Err(Rejection::Aborted),
                outcome = transport.call(
                    TransportRequest { endpoint: endpoint.clone(), args: args.clone() },
                    ctx,
                ) => outcome.map_err(Rejection::Transport),
            };
            let event = match result {
                Ok(data) => {
                    let provided = api
                        .get(&endpoint)
                        .map(|e| e.resolve_tags(&data, &args))
                        .unwrap_or_default();
                    Event::QueryFulfilled {
                        cache_key,
                        request_id,
                        data: Arc::new(data),
                        provided,
                        fulfilled_at: epoch_ms(),
                    }
                }
                Err(rejection) => Event::QueryRejected {
                    cache_key,
                    request_id,
                    rejection,
                    subscribe: None,
                },
            };
            let _ = tx.send(Op::Apply(event));
        });

        (request_id, token, outcome_rx)
    }

    fn start_mutation(
        &mut self,
        endpoint: String,
        args: Value,
        track: bool,
        reply: oneshot::Sender<StartedMutation>,
    ) {
        let request_id = RequestId(self.alloc_id());
        let token = CancellationToken::new();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        self.waiters.insert(request_id, vec![outcome_tx]);

        if track {
            self.commit(Event::MutationPending {
                endpoint: endpoint.clone(),
                request_id,
                started_at: epoch_ms(),
            });
        }

        let transport = self.transport.clone();
        let api = self.api.clone();
        let tx = self.tx.clone();
        let snapshots = self.snapshots.subscribe();
        let task_token = token.clone();
        tokio::spawn(async move {
            let ctx = TransportContext::new(task_token.clone(), snapshots);
            let result = tokio::select! {
                () = task_token.cancelled() => Err(Rejection::Aborted),
                outcome = transport.call(
                    TransportRequest { endpoint: endpoint.clone(), args: args.clone() },
                    ctx,
                ) => outcome.map_err(Rejection::Transport),
            };
            let event = match result {
                Ok(data) => {
                    let invalidated = api
                        .get(&endpoint)
                        .map(|e| e.resolve_tags(&data, &args))
                        .unwrap_or_default();
                    Event::MutationFulfilled {
                        request_id,
                        data: Arc::new(data),
                        invalidated,
                        fulfilled_at: epoch_ms(),
                        tracked: track,
                    }
                }
                Err(rejection) => Event::MutationRejected {
                    request_id,
                    rejection,
                    tracked: track,
                },
            };
            let _ = tx.send(Op::Apply(event));
        });

        let _ = reply.send(StartedMutation {
            request_id,
            token,
            outcome: outcome_rx,
        });
    }

    fn update_result(
        &mut self,
        cache_key: CacheKey,
        recipe: Box<dyn FnOnce(&mut Value) + Send>,
        reply: oneshot::Sender<PatchSet>,
    ) {
        let Some(old) = self
            .state
            .queries
            .get(&cache_key)
            .and_then(|record| record.data.clone())
        else {
            let _ = reply.send(PatchSet::default());
            return;
        };

        let mut updated = (*old).clone();
        recipe(&mut updated);
        let set = patch::diff(&old, &updated);
        if !set.is_empty() {
            self.commit(Event::QueryPatched {
                cache_key,
                patches: set.patches.clone(),
            });
        }
        let _ = reply.send(set);
    }

    /// Forced refetch reusing the record's stored arguments. Uninitialized
    /// or missing records have nothing to refetch.
    fn refetch(&mut self, cache_key: CacheKey) {
        let Some(record) = self.state.queries.get(&cache_key) else {
            return;
        };
        if record.status == QueryStatus::Uninitialized {
            return;
        }
        let endpoint = record.endpoint.clone();
        let args = record.original_args.clone();
        debug!(cache_key = %cache_key, endpoint = %endpoint, "refetching");
        let _ = self.begin_fetch(endpoint, args, cache_key, None);
    }

    fn gc_expired(&mut self, cache_key: CacheKey) {
        // Re-check under the serialized step: a subscriber may have joined
        // after the timer fired but before this op was processed.
        if self.state.subscriber_count(&cache_key) == 0
            && self.state.queries.contains_key(&cache_key)
        {
            debug!(cache_key = %cache_key, "gc grace period elapsed, removing");
            self.commit(Event::RemoveQueryResult { cache_key });
        }
    }

    /// Applies one event: reduce, publish the snapshot, resolve waiting
    /// handles, then let the scheduler react.
    fn commit(&mut self, event: Event) {
        reducer::reduce(&mut self.state, &event);
        self.snapshots.send_replace(Arc::new(self.state.clone()));
        self.resolve_waiters(&event);
        self.scheduler.after_commit(&event, &self.state);
    }

    fn resolve_waiters(&mut self, event: &Event) {
        match event {
            Event::QueryFulfilled {
                request_id,
                cache_key,
                data,
                ..
            } => {
                self.clear_inflight(cache_key, *request_id);
                if let Some(waiters) = self.waiters.remove(request_id) {
                    // Prefer the record's (structurally shared) allocation
                    // when this request still owns it.
                    let value = self
                        .state
                        .queries
                        .get(cache_key)
                        .filter(|record| record.request_id == *request_id)
                        .and_then(|record| record.data.clone())
                        .unwrap_or_else(|| data.clone());
                    for waiter in waiters {
                        let _ = waiter.send(Ok(value.clone()));
                    }
                }
            }
            Event::QueryRejected {
                request_id,
                cache_key,
                rejection,
                ..
            } => {
                let Some(error) = rejection.clone().into_error() else {
                    return; // condition skips resolve through the in-flight request
                };
                self.clear_inflight(cache_key, *request_id);
                if let Some(waiters) = self.waiters.remove(request_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Err(error.clone()));
                    }
                }
            }
            Event::MutationFulfilled {
                request_id, data, ..
            } => {
                if let Some(waiters) = self.waiters.remove(request_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Ok(data.clone()));
                    }
                }
            }
            Event::MutationRejected {
                request_id,
                rejection,
                ..
            } => {
                let Some(error) = rejection.clone().into_error() else {
                    return;
                };
                if let Some(waiters) = self.waiters.remove(request_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Err(error.clone()));
                    }
                }
            }
            _ => {}
        }
    }

    fn clear_inflight(&mut self, cache_key: &CacheKey, request_id: RequestId) {
        if self
            .inflight
            .get(cache_key)
            .is_some_and(|(owning, _)| *owning == request_id)
        {
            self.inflight.remove(cache_key);
        }
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
