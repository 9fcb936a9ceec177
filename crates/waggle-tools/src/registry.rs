//! The declarative tool table.
//!
//! Tools are registered once at startup, each with its name, typed parameter
//! descriptors, and a handler value. The table is immutable afterwards; the
//! dispatcher only reads it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use waggle_types::HubResult;

use crate::args::{Args, ParamSpec};
use crate::dispatch::CallContext;
use crate::truncate::DEFAULT_OUTPUT_LIMIT;

/// Default per-call deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Registration-time errors. These abort startup; they are never surfaced
/// to a drone.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("duplicate tool name: {0}")]
    DuplicateName(String),
}

/// Declared metadata for one tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    /// Whether the handler needs a live session (and is cancelled with it).
    pub requires_session: bool,
    /// Opt-in per-session serialization of calls.
    pub requires_session_lock: bool,
    /// Character cap for the serialized result.
    pub output_limit: usize,
    /// Per-call deadline.
    pub deadline: Duration,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
            requires_session: false,
            requires_session_lock: false,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            deadline: DEFAULT_DEADLINE,
        }
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn requires_session(mut self) -> Self {
        self.requires_session = true;
        self
    }

    pub fn session_locked(mut self) -> Self {
        self.requires_session = true;
        self.requires_session_lock = true;
        self
    }

    pub fn output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

/// A tool implementation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, ctx: CallContext, args: Args) -> HubResult<JsonValue>;
}

/// Adapter turning an async closure into a [`ToolHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(CallContext, Args) -> Fut + Send + Sync,
    Fut: Future<Output = HubResult<JsonValue>> + Send,
{
    async fn call(&self, ctx: CallContext, args: Args) -> HubResult<JsonValue> {
        (self.0)(ctx, args).await
    }
}

pub(crate) struct RegisteredTool {
    pub(crate) spec: ToolSpec,
    pub(crate) handler: Arc<dyn ToolHandler>,
}

/// The tool table. Built at startup, then shared read-only.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool with its handler.
    pub fn register(
        &mut self,
        spec: ToolSpec,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), RegistryError> {
        if self.tools.contains_key(&spec.name) {
            return Err(RegistryError::DuplicateName(spec.name));
        }
        self.tools
            .insert(spec.name.clone(), RegisteredTool { spec, handler });
        Ok(())
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(&mut self, spec: ToolSpec, f: F) -> Result<(), RegistryError>
    where
        F: Fn(CallContext, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HubResult<JsonValue>> + Send + 'static,
    {
        self.register(spec, Arc::new(FnHandler(f)))
    }

    pub(crate) fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn spec(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name).map(|t| &t.spec)
    }

    /// All specs, sorted by name for stable listings.
    pub fn specs(&self) -> Vec<&ToolSpec> {
        let mut specs: Vec<&ToolSpec> = self.tools.values().map(|t| &t.spec).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_and_list() {
        let mut registry = ToolRegistry::new();
        registry
            .register_fn(ToolSpec::new("zeta", "z"), |_ctx, _args| async {
                Ok(json!("z"))
            })
            .unwrap();
        registry
            .register_fn(ToolSpec::new("alpha", "a"), |_ctx, _args| async {
                Ok(json!("a"))
            })
            .unwrap();

        let names: Vec<&str> = registry.specs().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = ToolRegistry::new();
        registry
            .register_fn(ToolSpec::new("dup", ""), |_ctx, _args| async {
                Ok(JsonValue::Null)
            })
            .unwrap();
        let err = registry
            .register_fn(ToolSpec::new("dup", ""), |_ctx, _args| async {
                Ok(JsonValue::Null)
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(_)));
    }

    #[test]
    fn test_spec_builder_defaults() {
        let spec = ToolSpec::new("t", "d");
        assert_eq!(spec.output_limit, DEFAULT_OUTPUT_LIMIT);
        assert_eq!(spec.deadline, DEFAULT_DEADLINE);
        assert!(!spec.requires_session);

        let locked = ToolSpec::new("t", "d").session_locked();
        assert!(locked.requires_session);
        assert!(locked.requires_session_lock);
    }
}
