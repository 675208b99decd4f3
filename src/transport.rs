//! The outbound transport contract.
//!
//! The engine is transport-agnostic: it hands a request payload to a
//! [`Transport`] and expects either a JSON result or an opaque JSON error.
//! HTTP helpers, retry/backoff decorators, and test doubles all live on the
//! collaborator side of this trait.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::state::CacheState;

/// What the engine asks the transport to do.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub endpoint: String,
    pub args: Value,
}

/// Capabilities handed to the transport alongside the request.
pub struct TransportContext {
    /// Cancelled when the caller aborts the request. Transports should stop
    /// work when this fires; the engine records the abort either way.
    pub signal: CancellationToken,
    snapshots: watch::Receiver<Arc<CacheState>>,
}

impl TransportContext {
    pub(crate) fn new(
        signal: CancellationToken,
        snapshots: watch::Receiver<Arc<CacheState>>,
    ) -> Self {
        Self { signal, snapshots }
    }

    /// The cache tree as of the latest committed transition.
    pub fn state(&self) -> Arc<CacheState> {
        self.snapshots.borrow().clone()
    }
}

/// `Ok` carries the result payload, `Err` an opaque error payload that is
/// stored on the record verbatim.
pub type TransportOutcome = Result<Value, Value>;

/// The transport collaborator. One call per dispatched request; the engine
/// never retries — retry policy belongs in a decorator around this trait.
pub trait Transport: Send + Sync + 'static {
    fn call(
        &self,
        request: TransportRequest,
        ctx: TransportContext,
    ) -> BoxFuture<'static, TransportOutcome>;
}

/// Closures are transports, which keeps tests and small setups short.
impl<F> Transport for F
where
    F: Fn(TransportRequest, TransportContext) -> BoxFuture<'static, TransportOutcome>
        + Send
        + Sync
        + 'static,
{
    fn call(
        &self,
        request: TransportRequest,
        ctx: TransportContext,
    ) -> BoxFuture<'static, TransportOutcome> {
        self(request, ctx)
    }
}
