//! # waggle-swarm
//!
//! Drone coordination: the agent registry (identity, liveness, workload,
//! delegation) and the broadcast bus (totally ordered fan-out with replay).
//!
//! Both services are process-wide singletons. The registry sits behind one
//! mutex; the bus keeps an append-only replay ring plus a live channel, and
//! ids are assigned under the ring lock so channel order always matches ring
//! order.

pub mod broadcast;
pub mod registry;

pub use broadcast::{Broadcast, BroadcastBus, Severity, REPLAY_CAP};
pub use registry::{
    AgentRecord, AgentRegistry, AgentStatus, Delegation, DelegateRequest, RegisterRequest,
    RosterPage, RosterRequest, SwarmError, DEFAULT_LIVENESS_WINDOW_MS, DEFAULT_MAX_WORKLOAD,
};
