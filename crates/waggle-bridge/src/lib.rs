//! # waggle-bridge
//!
//! Outbound connections to external MCP tool servers. Each bridge is either
//! a child process speaking stdio or a remote streamable-HTTP endpoint; the
//! hub proxies tool calls to them under `server:tool` identifiers.
//!
//! A supervisor task owns every stdio child and restarts it on exit with
//! exponential backoff. Proxy calls go through a correlation table and a
//! per-bridge in-flight cap; late responses are logged and dropped.

pub mod config;
pub mod manager;

pub use config::{discover_local_servers, parse_bridge_file, BridgeConfig, BridgeTransport};
pub use manager::{
    BridgeError, BridgeInfo, BridgeManager, BridgeStatus, BridgeToolInfo, ProxyOutput,
    DEFAULT_INFLIGHT_CAP, DEFAULT_PROXY_DEADLINE,
};
