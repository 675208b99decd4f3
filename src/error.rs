//! Error types for queries, mutations, and the engine API.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Terminal error attached to a rejected query or mutation record.
///
/// Transport failures are stored verbatim: whatever JSON payload the
/// transport collaborator returned ends up on the record untouched, so
/// callers can round-trip their own error shapes through the cache.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryError {
    /// The transport collaborator failed. The payload is opaque to the engine.
    #[error("transport error: {0}")]
    Transport(Value),

    /// The in-flight request was aborted through its handle.
    ///
    /// Distinct from [`QueryError::Transport`]: an abort is caller-initiated
    /// and carries no payload.
    #[error("request aborted")]
    Aborted,
}

impl QueryError {
    /// Returns `true` if this error came from an [`abort`](crate::engine::QueryHandle::abort).
    pub const fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

/// Errors surfaced by the engine API itself, as opposed to errors produced
/// by individual requests.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The endpoint name is not registered on the [`Api`](crate::endpoint::Api).
    #[error("unknown endpoint `{0}`")]
    UnknownEndpoint(String),

    /// A query operation was invoked on a mutation endpoint.
    #[error("endpoint `{0}` is a mutation, not a query")]
    NotAQuery(String),

    /// A mutation operation was invoked on a query endpoint.
    #[error("endpoint `{0}` is a query, not a mutation")]
    NotAMutation(String),

    /// The engine pipeline has shut down and no longer accepts work.
    #[error("engine is shut down")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transport_error_display() {
        let err = QueryError::Transport(json!({"status": 500}));
        assert_eq!(err.to_string(), r#"transport error: {"status":500}"#);
    }

    #[test]
    fn test_aborted_display() {
        let err = QueryError::Aborted;
        assert_eq!(err.to_string(), "request aborted");
        assert!(err.is_aborted());
    }

    #[test]
    fn test_transport_payload_round_trips() {
        let payload = json!({"code": "E_TEAPOT", "detail": [1, 2, 3]});
        let err = QueryError::Transport(payload.clone());

        let serialized = serde_json::to_value(&err).expect("serializable");
        let restored: QueryError = serde_json::from_value(serialized).expect("deserializable");
        assert_eq!(restored, QueryError::Transport(payload));
    }
}
