//! Invalidation and scheduling middleware.
//!
//! Runs inside the pipeline task after every committed transition and turns
//! transitions into side effects: tag invalidation sweeps, polling timers,
//! focus/reconnect sweeps, and deferred garbage collection. Each cache key
//! owns at most one poll timer and one GC timer, and a timer is always
//! cancelled before a replacement is armed.

use std::collections::{HashMap, HashSet};

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::endpoint::Tag;
use crate::engine::Op;
use crate::event::Event;
use crate::key::CacheKey;
use crate::state::{CacheState, QueryStatus, SubscriptionOptions};

/// Handle for a running timer task.
struct TimerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl TimerHandle {
    fn new(token: CancellationToken, join: JoinHandle<()>) -> Self {
        Self { token, join }
    }

    /// Cancel the timer without waiting for the task to wind down.
    fn cancel(self) {
        self.token.cancel();
        self.join.abort();
    }
}

/// Which connectivity sweep to run.
#[derive(Clone, Copy)]
enum Sweep {
    Focus,
    Reconnect,
}

pub(crate) struct Scheduler {
    tx: tokio::sync::mpsc::UnboundedSender<Op>,
    poll_timers: HashMap<CacheKey, TimerHandle>,
    gc_timers: HashMap<CacheKey, TimerHandle>,
}

impl Scheduler {
    pub(crate) fn new(tx: tokio::sync::mpsc::UnboundedSender<Op>) -> Self {
        Self {
            tx,
            poll_timers: HashMap::new(),
            gc_timers: HashMap::new(),
        }
    }

    /// Reacts to a committed transition. `state` is the tree after the
    /// reducer applied `event`.
    pub(crate) fn after_commit(&mut self, event: &Event, state: &CacheState) {
        match event {
            Event::QueryPending {
                cache_key,
                subscribe,
                ..
            } => {
                if subscribe.is_some() {
                    self.cancel_gc(cache_key);
                    self.recompute_polling(cache_key, state);
                }
            }

            Event::QueryFulfilled { cache_key, .. } => {
                self.recompute_polling(cache_key, state);
            }

            Event::QueryRejected {
                cache_key,
                rejection,
                subscribe,
                ..
            } => {
                if rejection.is_condition() {
                    // A new subscriber joined an in-flight record; the key
                    // is alive again and its interval may have changed.
                    if subscribe.is_some() {
                        self.cancel_gc(cache_key);
                        self.recompute_polling(cache_key, state);
                    }
                } else {
                    self.recompute_polling(cache_key, state);
                }
            }

            Event::MutationFulfilled { invalidated, .. } => {
                self.invalidate(invalidated, state);
            }

            Event::Unsubscribed { cache_key, .. } => {
                self.recompute_polling(cache_key, state);
                if state.subscriber_count(cache_key) == 0
                    && state.queries.contains_key(cache_key)
                {
                    self.arm_gc(cache_key, state);
                }
            }

            Event::SubscriptionOptionsUpdated { cache_key, .. } => {
                self.recompute_polling(cache_key, state);
            }

            Event::RemoveQueryResult { cache_key } => {
                self.cancel_gc(cache_key);
                if let Some(timer) = self.poll_timers.remove(cache_key) {
                    timer.cancel();
                }
            }

            Event::OnlineChanged(true) => self.sweep(state, Sweep::Reconnect),
            Event::FocusChanged(true) => self.sweep(state, Sweep::Focus),

            Event::MutationPending { .. }
            | Event::MutationRejected { .. }
            | Event::QueryPatched { .. }
            | Event::RemoveMutationResult { .. }
            | Event::OnlineChanged(false)
            | Event::FocusChanged(false)
            | Event::ConfigUpdated(_) => {}
        }
    }

    /// Cancels every outstanding timer; called when the pipeline stops.
    pub(crate) fn shutdown(&mut self) {
        for (_, timer) in self.poll_timers.drain() {
            timer.cancel();
        }
        for (_, timer) in self.gc_timers.drain() {
            timer.cancel();
        }
    }

    /// Resolves the cache keys hit by `tags` and removes or refetches each.
    fn invalidate(&mut self, tags: &[Tag], state: &CacheState) {
        let mut keys: HashSet<CacheKey> = HashSet::new();
        for tag in tags {
            keys.extend(state.provided.invalidated_by(tag));
        }

        for key in keys {
            let Some(record) = state.queries.get(&key) else {
                continue;
            };
            if state.subscriber_count(&key) == 0 {
                debug!(cache_key = %key, "invalidated with no subscribers, removing");
                let _ = self.tx.send(Op::Apply(Event::RemoveQueryResult { cache_key: key }));
            } else if record.status != QueryStatus::Uninitialized {
                debug!(cache_key = %key, "invalidated, refetching");
                let _ = self.tx.send(Op::Refetch { cache_key: key });
            }
        }
    }

    /// Cancels and, if the key still warrants one, re-arms the poll timer.
    fn recompute_polling(&mut self, key: &CacheKey, state: &CacheState) {
        if let Some(timer) = self.poll_timers.remove(key) {
            timer.cancel();
        }

        if !state.queries.contains_key(key) {
            return;
        }
        let Some(every) = state.min_polling_interval(key) else {
            return;
        };

        trace!(cache_key = %key, interval_ms = every.as_millis() as u64, "arming poll timer");
        let token = CancellationToken::new();
        let timer_token = token.clone();
        let tx = self.tx.clone();
        let cache_key = key.clone();
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately; polling starts one interval out.
            let mut ticks = IntervalStream::new(interval).skip(1);
            loop {
                tokio::select! {
                    () = timer_token.cancelled() => break,
                    tick = ticks.next() => {
                        if tick.is_none()
                            || tx.send(Op::Refetch { cache_key: cache_key.clone() }).is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });
        self.poll_timers.insert(key.clone(), TimerHandle::new(token, join));
    }

    /// Arms the removal grace timer for a key that just lost its last
    /// subscriber. Debounced: an existing timer is replaced, and a
    /// re-subscribe cancels it through [`Scheduler::cancel_gc`].
    fn arm_gc(&mut self, key: &CacheKey, state: &CacheState) {
        self.cancel_gc(key);

        let keep = state.config.keep_unused_data_for;
        trace!(cache_key = %key, keep_ms = keep.as_millis() as u64, "arming gc timer");
        let token = CancellationToken::new();
        let timer_token = token.clone();
        let tx = self.tx.clone();
        let cache_key = key.clone();
        let join = tokio::spawn(async move {
            tokio::select! {
                () = timer_token.cancelled() => {}
                () = tokio::time::sleep(keep) => {
                    let _ = tx.send(Op::GcExpired { cache_key });
                }
            }
        });
        self.gc_timers.insert(key.clone(), TimerHandle::new(token, join));
    }

    fn cancel_gc(&mut self, key: &CacheKey) {
        if let Some(timer) = self.gc_timers.remove(key) {
            timer.cancel();
        }
    }

    /// Refetches live, initialized keys after a focus or reconnect signal.
    ///
    /// A key qualifies when any subscriber explicitly opted in, or when no
    /// subscriber opted out and the global default is enabled.
    fn sweep(&mut self, state: &CacheState, kind: Sweep) {
        let default = match kind {
            Sweep::Focus => state.config.refetch_on_focus,
            Sweep::Reconnect => state.config.refetch_on_reconnect,
        };

        for (key, subscribers) in &state.subscriptions {
            let Some(record) = state.queries.get(key) else {
                continue;
            };
            if record.status == QueryStatus::Uninitialized {
                continue;
            }

            let preference = |options: &SubscriptionOptions| match kind {
                Sweep::Focus => options.refetch_on_focus,
                Sweep::Reconnect => options.refetch_on_reconnect,
            };
            let opted_in = subscribers.values().any(|o| preference(o) == Some(true));
            let none_opted_out = subscribers.values().all(|o| preference(o) != Some(false));

            if opted_in || (none_opted_out && default) {
                debug!(cache_key = %key, "connectivity sweep refetch");
                let _ = self.tx.send(Op::Refetch { cache_key: key.clone() });
            }
        }
    }
}
