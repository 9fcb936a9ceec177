//! # waggle-tools
//!
//! The tool plane: a declarative registry populated once at startup, typed
//! argument coercion at the dispatch boundary, per-call deadlines, uniform
//! error wrapping, and a single output truncator applied to every result.

pub mod args;
pub mod dispatch;
pub mod registry;
pub mod truncate;

pub use args::{Args, ParamSpec, ParamType};
pub use dispatch::{CallContext, Dispatcher};
pub use registry::{FnHandler, ToolHandler, ToolRegistry, ToolSpec};
pub use truncate::{truncate_output, DEFAULT_OUTPUT_LIMIT};
