//! Wire frames for the tool-RPC protocol.
//!
//! A drone POSTs a [`ToolInvocation`] to the message ingress and receives the
//! matching [`ResultFrame`] out-of-band on its SSE stream. Correlation is by
//! the caller-chosen `id` string; the hub never interprets it.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::ErrorPayload;

/// SSE event name carrying the freshly minted session id (first frame).
pub const EVENT_SESSION: &str = "session";
/// SSE event name for tool results.
pub const EVENT_RESULT: &str = "result";
/// SSE event name for swarm broadcasts.
pub const EVENT_BROADCAST: &str = "broadcast";
/// SSE event name for keep-alive frames.
pub const EVENT_PING: &str = "ping";

/// A single tool invocation, as posted to `/messages?session_id=…`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Opaque correlation string chosen by the caller.
    pub id: String,
    /// Tool name.
    pub tool: String,
    /// Named arguments. Must be a JSON object; missing means `{}`.
    #[serde(default)]
    pub args: JsonValue,
}

/// The result frame delivered on the SSE stream as `event: result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultFrame {
    /// Correlation id echoed from the invocation.
    pub id: String,
    /// Whether the tool succeeded.
    pub ok: bool,
    /// On success: the (possibly truncated) tool output.
    /// On failure: an [`ErrorPayload`] object.
    pub payload: JsonValue,
}

impl ResultFrame {
    /// Build a success frame.
    pub fn ok(id: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload,
        }
    }

    /// Build a failure frame from an error payload.
    pub fn err(id: impl Into<String>, payload: ErrorPayload) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: serde_json::to_value(payload).unwrap_or(JsonValue::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HubError;

    #[test]
    fn test_invocation_defaults_args() {
        let inv: ToolInvocation =
            serde_json::from_str(r#"{"id":"a1","tool":"hub_status"}"#).unwrap();
        assert_eq!(inv.id, "a1");
        assert!(inv.args.is_null());
    }

    #[test]
    fn test_result_frame_err_shape() {
        let frame = ResultFrame::err("a1", HubError::ToolNotFound("nope".into()).to_payload());
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["payload"]["kind"], "tool_not_found");
    }
}
