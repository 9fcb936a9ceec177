//! The hub's tool table.
//!
//! Every operation a drone can invoke is declared here, one registration
//! call per tool, grouped by the service it fronts. Admin HTTP routes call
//! the same service methods, so both planes stay semantically identical.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use waggle_backup::BackupEngine;
use waggle_bridge::BridgeManager;
use waggle_memory::SharedMemoryStore;
use waggle_swarm::{AgentRegistry, BroadcastBus};
use waggle_tickets::TicketCoordinator;
use waggle_tools::registry::RegistryError;
use waggle_tools::{ToolRegistry, ToolSpec};
use waggle_types::{now_ms, HubError};

use crate::config::ToolSection;
use crate::session::SharedSessionTable;

mod backup_tools;
mod bridge_tools;
mod convert;
mod memory_tools;
mod swarm_tools;
mod ticket_tools;

pub(crate) use convert::{backup_err, bridge_err, memory_err, swarm_err, ticket_err};

/// Everything tool handlers close over.
pub struct Services {
    pub machine_id: String,
    pub started_at: i64,
    pub memory: SharedMemoryStore,
    pub swarm: Arc<AgentRegistry>,
    pub bus: Arc<BroadcastBus>,
    pub bridges: Arc<BridgeManager>,
    pub backup: Arc<BackupEngine>,
    pub tickets: Arc<TicketCoordinator>,
    pub sessions: SharedSessionTable,
    pub bridge_discovery_paths: Vec<PathBuf>,
}

/// Build the complete tool table.
pub fn build_registry(
    services: &Arc<Services>,
    section: &ToolSection,
) -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();

    memory_tools::register(&mut registry, services, section)?;
    swarm_tools::register(&mut registry, services, section)?;
    bridge_tools::register(&mut registry, services, section)?;
    backup_tools::register(&mut registry, services, section)?;
    ticket_tools::register(&mut registry, services, section)?;

    // Meta: one cheap status probe for drones and dashboards.
    let svc = services.clone();
    registry.register_fn(
        spec(section, "hub_status", "Hub liveness and component counters"),
        move |_ctx, _args| {
            let svc = svc.clone();
            async move {
                Ok(json!({
                    "machine_id": svc.machine_id,
                    "uptime_ms": now_ms() - svc.started_at,
                    "memories": svc.memory.len(),
                    "agents": svc.swarm.len(),
                    "live_sessions": svc.sessions.live_count(),
                    "bridges": svc.bridges.list().len(),
                    "last_broadcast_id": svc.bus.last_id(),
                    "memory_available": svc.memory.is_available(),
                }))
            }
        },
    )?;

    Ok(registry)
}

/// A spec with the section's deadline and output limit applied.
pub(crate) fn spec(section: &ToolSection, name: &str, description: &str) -> ToolSpec {
    ToolSpec::new(name, description)
        .deadline(Duration::from_secs(section.deadline_s))
        .output_limit(section.output_limit)
}

/// Shorthand for handler-side JSON encoding of service results.
pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, HubError> {
    serde_json::to_value(value).map_err(|e| HubError::Internal(format!("encode-{e}")))
}
