//! The dispatch pipeline: lookup, coercion, deadline, error wrapping,
//! serialization, truncation.
//!
//! This is the only place that catches unexpected handler failures. Anything
//! that is not already a `HubError` becomes `Internal` with a correlation id
//! that appears only in the log, never on the wire.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use waggle_types::{HubError, HubResult, SessionId};

use crate::args::Args;
use crate::registry::ToolRegistry;
use crate::truncate::truncate_output;

/// Per-call context handed to every handler.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// The originating session, when the call arrived over the session plane.
    pub session_id: Option<SessionId>,
    /// Cancelled when the originating session enters `closing`.
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn detached() -> Self {
        Self {
            session_id: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn for_session(session_id: SessionId, cancel: CancellationToken) -> Self {
        Self {
            session_id: Some(session_id),
            cancel,
        }
    }
}

/// The dispatcher. Cheap to clone via `Arc`.
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    /// Lazily created per-session locks for `requires_session_lock` tools.
    session_locks: Mutex<HashMap<SessionId, Arc<AsyncMutex<()>>>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run one invocation through the full pipeline.
    ///
    /// The returned value is wire-ready: strings pass through, structured
    /// values stay structured unless truncation had to cut them down to text.
    pub async fn dispatch(
        &self,
        tool_name: &str,
        raw_args: JsonValue,
        ctx: CallContext,
    ) -> HubResult<JsonValue> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| HubError::ToolNotFound(tool_name.to_string()))?;

        if tool.spec.requires_session && ctx.session_id.is_none() {
            return Err(HubError::BadArgument(format!(
                "tool '{tool_name}' requires a session"
            )));
        }

        let args = Args::coerce(tool_name, &tool.spec.params, raw_args)?;

        // Session-serialized tools take their session's lock for the whole
        // call; everything else runs re-entrant.
        let session_lock = if tool.spec.requires_session_lock {
            ctx.session_id.map(|sid| self.lock_for(sid))
        } else {
            None
        };
        let _guard = match &session_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let handler = Arc::clone(&tool.handler);
        let deadline = tool.spec.deadline;
        let cancel = ctx.cancel.clone();
        let session_bound = tool.spec.requires_session;
        let call = handler.call(ctx, args);

        // Session-bound calls abort when their session enters closing, so
        // held resources (workload counters, locks) come back promptly.
        let result = tokio::select! {
            _ = cancel.cancelled(), if session_bound => {
                warn!(tool = tool_name, "tool call cancelled with its session");
                return Err(HubError::Tool("session closed during call".into()));
            }
            outcome = tokio::time::timeout(deadline, call) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    warn!(tool = tool_name, deadline_s = deadline.as_secs(), "tool call hit deadline");
                    return Err(HubError::Tool(format!(
                        "deadline exceeded after {}s",
                        deadline.as_secs()
                    )));
                }
            }
        };

        let value = result.map_err(|e| self.wrap_error(tool_name, e))?;
        Ok(Self::finish(value, tool.spec.output_limit))
    }

    /// Serialize and truncate a successful result.
    fn finish(value: JsonValue, limit: usize) -> JsonValue {
        let serialized = match &value {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        };
        let (text, cut) = truncate_output(serialized, limit);
        if cut {
            JsonValue::String(text)
        } else {
            value
        }
    }

    /// Domain errors pass through; anything else would be a bug leak, so it
    /// is replaced by an opaque `Internal` with a logged correlation id.
    fn wrap_error(&self, tool_name: &str, err: HubError) -> HubError {
        match err {
            HubError::Internal(correlation) => {
                error!(tool = tool_name, correlation = %correlation, "internal error in tool handler");
                HubError::Internal(correlation)
            }
            surfaced => surfaced,
        }
    }

    fn lock_for(&self, session_id: SessionId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.session_locks.lock();
        locks
            .entry(session_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Drop the per-session lock entry once a session is gone.
    pub fn forget_session(&self, session_id: SessionId) {
        self.session_locks.lock().remove(&session_id);
    }
}

/// Mint a correlation id for an internal error and log the cause.
pub fn internal_error(context: &str, cause: impl std::fmt::Display) -> HubError {
    let correlation = uuid::Uuid::new_v4().as_simple().to_string()[..8].to_string();
    error!(correlation = %correlation, context, cause = %cause, "internal error");
    HubError::Internal(correlation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::{ParamSpec, ParamType};
    use crate::registry::ToolSpec;
    use serde_json::json;
    use std::time::Duration;

    fn dispatcher_with(registry: ToolRegistry) -> Dispatcher {
        Dispatcher::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let dispatcher = dispatcher_with(ToolRegistry::new());
        let err = dispatcher
            .dispatch("nope", json!({}), CallContext::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_happy_path_echo() {
        let mut registry = ToolRegistry::new();
        registry
            .register_fn(
                ToolSpec::new("echo", "echo back")
                    .param(ParamSpec::required("text", ParamType::String)),
                |_ctx, args| async move { Ok(json!(args.str("text")?)) },
            )
            .unwrap();

        let dispatcher = dispatcher_with(registry);
        let out = dispatcher
            .dispatch("echo", json!({"text": "hello"}), CallContext::detached())
            .await
            .unwrap();
        assert_eq!(out, json!("hello"));
    }

    #[tokio::test]
    async fn test_bad_argument_surfaces() {
        let mut registry = ToolRegistry::new();
        registry
            .register_fn(
                ToolSpec::new("echo", "")
                    .param(ParamSpec::required("text", ParamType::String)),
                |_ctx, _args| async { Ok(JsonValue::Null) },
            )
            .unwrap();

        let dispatcher = dispatcher_with(registry);
        let err = dispatcher
            .dispatch("echo", json!({}), CallContext::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::BadArgument(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_enforced() {
        let mut registry = ToolRegistry::new();
        registry
            .register_fn(
                ToolSpec::new("slow", "").deadline(Duration::from_millis(50)),
                |_ctx, _args| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(JsonValue::Null)
                },
            )
            .unwrap();

        let dispatcher = dispatcher_with(registry);
        let err = dispatcher
            .dispatch("slow", json!({}), CallContext::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Tool(_)));
    }

    #[tokio::test]
    async fn test_truncation_applied_uniformly() {
        let mut registry = ToolRegistry::new();
        registry
            .register_fn(
                ToolSpec::new("big", "").output_limit(100),
                |_ctx, _args| async { Ok(json!("y".repeat(500))) },
            )
            .unwrap();

        let dispatcher = dispatcher_with(registry);
        let out = dispatcher
            .dispatch("big", json!({}), CallContext::detached())
            .await
            .unwrap();
        let text = out.as_str().unwrap();
        assert!(text.contains("[output truncated"));
        assert!(text.chars().count() < 300);
    }

    #[tokio::test]
    async fn test_structured_results_stay_structured() {
        let mut registry = ToolRegistry::new();
        registry
            .register_fn(ToolSpec::new("obj", ""), |_ctx, _args| async {
                Ok(json!({"a": 1}))
            })
            .unwrap();

        let dispatcher = dispatcher_with(registry);
        let out = dispatcher
            .dispatch("obj", json!({}), CallContext::detached())
            .await
            .unwrap();
        assert_eq!(out, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_session_lock_serializes_calls() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let concurrent = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let (c2, p2) = (concurrent.clone(), peak.clone());

        let mut registry = ToolRegistry::new();
        registry
            .register_fn(ToolSpec::new("locked", "").session_locked(), move |_ctx, _args| {
                let concurrent = c2.clone();
                let peak = p2.clone();
                async move {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    Ok(JsonValue::Null)
                }
            })
            .unwrap();

        let dispatcher = Arc::new(dispatcher_with(registry));
        let session = SessionId::new();
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let d = dispatcher.clone();
            let ctx = CallContext::for_session(session, cancel.clone());
            handles.push(tokio::spawn(async move {
                d.dispatch("locked", json!({}), ctx).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
