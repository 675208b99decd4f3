//! The pure transition function over the cache tree.
//!
//! All state changes happen here, one event at a time, inside the engine's
//! serialized pipeline. The reducer enforces the fencing invariant (a
//! completion only lands if its request id still owns the record) and the
//! structural-sharing rule (a refetch that returns identical data keeps the
//! previous allocation, so snapshot consumers see a stable pointer).

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::event::{Event, Rejection};
use crate::patch;
use crate::state::{CacheState, MutationRecord, QueryRecord, QueryStatus};

/// Applies one committed event to the tree.
pub fn reduce(state: &mut CacheState, event: &Event) {
    match event {
        Event::QueryPending {
            endpoint,
            cache_key,
            args,
            request_id,
            started_at,
            subscribe,
        } => {
            // A non-subscribing dispatch with no existing record is an
            // untracked one-shot fetch; nothing to cache.
            if subscribe.is_none() && !state.queries.contains_key(cache_key) {
                return;
            }

            let record = state
                .queries
                .entry(cache_key.clone())
                .or_insert_with(|| QueryRecord {
                    endpoint: endpoint.clone(),
                    status: QueryStatus::Uninitialized,
                    original_args: Value::Null,
                    request_id: *request_id,
                    data: None,
                    error: None,
                    started_at: *started_at,
                    fulfilled_at: None,
                });
            record.status = QueryStatus::Pending;
            record.request_id = *request_id;
            record.original_args = args.clone();
            record.started_at = *started_at;

            if let Some((subscriber_id, options)) = subscribe {
                state
                    .subscriptions
                    .entry(cache_key.clone())
                    .or_default()
                    .insert(*subscriber_id, *options);
            }
        }

        Event::QueryFulfilled {
            cache_key,
            request_id,
            data,
            provided,
            fulfilled_at,
        } => {
            let Some(record) = state.queries.get_mut(cache_key) else {
                return;
            };
            // Fencing: a superseded request's late result must not land.
            if record.request_id != *request_id {
                return;
            }

            record.status = QueryStatus::Fulfilled;
            record.data = Some(merge_preserving(record.data.take(), data));
            record.error = None;
            record.fulfilled_at = Some(*fulfilled_at);

            state.provided.remove_key(cache_key);
            for tag in provided {
                state.provided.insert(tag, cache_key);
            }
        }

        Event::QueryRejected {
            cache_key,
            request_id,
            rejection,
            subscribe,
        } => {
            if rejection.is_condition() {
                // The dedup condition skipped this dispatch; the caller
                // becomes a subscriber of the in-flight record instead.
                if let Some((subscriber_id, options)) = subscribe {
                    if state.queries.contains_key(cache_key) {
                        state
                            .subscriptions
                            .entry(cache_key.clone())
                            .or_default()
                            .insert(*subscriber_id, *options);
                    }
                }
                return;
            }

            let Some(record) = state.queries.get_mut(cache_key) else {
                return;
            };
            if record.request_id != *request_id {
                return;
            }
            record.status = QueryStatus::Rejected;
            record.error = rejection.clone().into_error();
        }

        Event::MutationPending {
            endpoint,
            request_id,
            started_at,
        } => {
            state.mutations.insert(
                *request_id,
                MutationRecord {
                    endpoint: endpoint.clone(),
                    status: QueryStatus::Pending,
                    data: None,
                    error: None,
                    started_at: *started_at,
                    fulfilled_at: None,
                },
            );
        }

        Event::MutationFulfilled {
            request_id,
            data,
            fulfilled_at,
            tracked,
            ..
        } => {
            if !tracked {
                return;
            }
            let Some(record) = state.mutations.get_mut(request_id) else {
                return;
            };
            record.status = QueryStatus::Fulfilled;
            record.data = Some(data.clone());
            record.error = None;
            record.fulfilled_at = Some(*fulfilled_at);
        }

        Event::MutationRejected {
            request_id,
            rejection,
            tracked,
        } => {
            if !tracked {
                return;
            }
            let Some(record) = state.mutations.get_mut(request_id) else {
                return;
            };
            record.status = QueryStatus::Rejected;
            record.error = rejection.clone().into_error();
        }

        Event::Unsubscribed {
            cache_key,
            subscriber_id,
        } => {
            if let Some(subscribers) = state.subscriptions.get_mut(cache_key) {
                subscribers.remove(subscriber_id);
                if subscribers.is_empty() {
                    state.subscriptions.remove(cache_key);
                }
            }
        }

        Event::SubscriptionOptionsUpdated {
            cache_key,
            subscriber_id,
            options,
        } => {
            if let Some(subscribers) = state.subscriptions.get_mut(cache_key) {
                if let Some(existing) = subscribers.get_mut(subscriber_id) {
                    *existing = *options;
                }
            }
        }

        Event::QueryPatched { cache_key, patches } => {
            let Some(record) = state.queries.get_mut(cache_key) else {
                return;
            };
            let Some(data) = record.data.take() else {
                return;
            };
            let mut patched = (*data).clone();
            match patch::apply(&mut patched, patches) {
                Ok(()) => record.data = Some(Arc::new(patched)),
                Err(err) => {
                    warn!(cache_key = %cache_key, error = %err, "dropping unapplicable patches");
                    record.data = Some(data);
                }
            }
        }

        Event::RemoveQueryResult { cache_key } => {
            state.queries.remove(cache_key);
            state.subscriptions.remove(cache_key);
            state.provided.remove_key(cache_key);
        }

        Event::RemoveMutationResult { request_id } => {
            state.mutations.remove(request_id);
        }

        Event::OnlineChanged(online) => state.online = *online,

        Event::FocusChanged(focused) => state.focused = *focused,

        Event::ConfigUpdated(config) => state.config = config.clone(),
    }
}

/// Keeps the previous allocation when a refetch returned identical data.
fn merge_preserving(old: Option<Arc<Value>>, new: &Arc<Value>) -> Arc<Value> {
    match old {
        Some(old) if *old == **new => old,
        _ => new.clone(),
    }
}
