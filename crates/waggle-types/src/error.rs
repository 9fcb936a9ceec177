//! Hub-wide error taxonomy.
//!
//! Every failure a drone or admin client can observe maps into one of these
//! kinds. Infrastructure errors never cross the dispatcher boundary raw: the
//! dispatcher rewrites anything unexpected into `Internal` with a correlation
//! id that only appears in the logs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias used across the workspace.
pub type HubResult<T> = Result<T, HubError>;

/// The error taxonomy surfaced to callers.
#[derive(Debug, Clone, Error)]
pub enum HubError {
    /// Invalid or missing tool argument.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// Unknown tool name.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Handler-raised domain error.
    #[error("{0}")]
    Tool(String),

    /// Missing or invalid credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but lacking the required role.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Stale session id presented to the message ingress.
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// A configured limit was hit (sessions, buffers, in-flight calls).
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Bridge did not answer within the call deadline.
    #[error("bridge timeout: {0}")]
    BridgeTimeout(String),

    /// Bridge is not in a state that accepts calls.
    #[error("bridge down: {0}")]
    BridgeDown(String),

    /// The memory store cannot serve reads or writes.
    #[error("memory store unavailable: {0}")]
    MemoryStoreUnavailable(String),

    /// A backing store (relational, board) is unreachable.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Bug-class fallback. The string is a correlation id, not a message.
    #[error("internal error (correlation {0})")]
    Internal(String),
}

impl HubError {
    /// Wire string for this kind, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::BadArgument(_) => "bad_argument",
            HubError::ToolNotFound(_) => "tool_not_found",
            HubError::Tool(_) => "tool_error",
            HubError::Unauthorized(_) => "unauthorized",
            HubError::Forbidden(_) => "forbidden",
            HubError::SessionExpired(_) => "session_expired",
            HubError::ResourceExhausted(_) => "resource_exhausted",
            HubError::BridgeTimeout(_) => "bridge_timeout",
            HubError::BridgeDown(_) => "bridge_down",
            HubError::MemoryStoreUnavailable(_) => "memory_store_unavailable",
            HubError::BackendUnavailable(_) => "backend_unavailable",
            HubError::Internal(_) => "internal",
        }
    }

    /// The JSON-shaped payload surfaced to callers.
    ///
    /// `Internal` deliberately hides its detail: callers get an opaque
    /// message plus the correlation id that pairs with the server log line.
    pub fn to_payload(&self) -> ErrorPayload {
        let message = match self {
            HubError::Internal(correlation) => {
                format!("internal error (correlation {correlation})")
            }
            other => other.to_string(),
        };
        ErrorPayload {
            kind: self.kind().to_string(),
            message,
        }
    }
}

/// Error payload as it appears on the wire: `{kind, message}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(HubError::BadArgument("x".into()).kind(), "bad_argument");
        assert_eq!(HubError::SessionExpired("s".into()).kind(), "session_expired");
        assert_eq!(HubError::Internal("c-1".into()).kind(), "internal");
    }

    #[test]
    fn test_internal_payload_is_opaque() {
        let payload = HubError::Internal("c0ffee42".into()).to_payload();
        assert_eq!(payload.kind, "internal");
        assert!(payload.message.contains("c0ffee42"));
    }

    #[test]
    fn test_payload_serializes_flat() {
        let payload = HubError::Tool("board rejected the update".into()).to_payload();
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "tool_error");
        assert_eq!(json["message"], "board rejected the update");
    }
}
