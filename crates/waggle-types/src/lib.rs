//! # waggle-types
//!
//! Shared types for the waggle hub: typed identifiers, the memory data model,
//! the tool-RPC wire frames, and the error taxonomy every component maps into.
//!
//! Everything here is plain data. Services that own behavior (memory store,
//! swarm registry, dispatcher, transport) live in their own crates and all
//! speak these types at their seams.

pub mod error;
pub mod ids;
pub mod memory;
pub mod time;
pub mod wire;

pub use error::{ErrorPayload, HubError, HubResult};
pub use ids::{AlertId, DiffId, MemoryId, SessionId, SnapshotId, TaskId, TicketId};
pub use memory::{MemoryCategory, MemoryItem, MemoryScope, MetaValue, Page};
pub use time::{now_ms, HOUR_MS};
pub use wire::{
    ResultFrame, ToolInvocation, EVENT_BROADCAST, EVENT_PING, EVENT_RESULT, EVENT_SESSION,
};
