//! Swarm coordination tools: registry, delegation, broadcast.

use std::str::FromStr;
use std::sync::Arc;

use serde_json::json;
use tracing::warn;

use waggle_backup::AgentTaskRow;
use waggle_memory::StoreRequest;
use waggle_swarm::{DelegateRequest, RegisterRequest, RosterRequest, Severity};
use waggle_tools::registry::RegistryError;
use waggle_tools::{ParamSpec, ParamType, ToolRegistry};
use waggle_types::{HubError, MemoryCategory, MemoryScope, MetaValue};

use super::{memory_err, spec, swarm_err, to_json, Services};
use crate::config::ToolSection;

pub(super) fn register(
    registry: &mut ToolRegistry,
    services: &Arc<Services>,
    section: &ToolSection,
) -> Result<(), RegistryError> {
    let svc = services.clone();
    registry.register_fn(
        spec(section, "register_agent", "Register or refresh a drone in the roster")
            .param(ParamSpec::required("agent_id", ParamType::String))
            .param(ParamSpec::required("role", ParamType::String))
            .param(ParamSpec::optional("capabilities", ParamType::List))
            .param(ParamSpec::optional("machine_id", ParamType::String))
            .param(ParamSpec::optional("metadata", ParamType::Map))
            .param(ParamSpec::optional("max_workload", ParamType::Int)),
        move |ctx, args| {
            let svc = svc.clone();
            async move {
                let machine_id = args
                    .opt_str("machine_id")
                    .map(str::to_string)
                    .unwrap_or_else(|| svc.machine_id.clone());
                let metadata = args
                    .map("metadata")
                    .map(|m| {
                        m.iter()
                            .map(|(k, v)| (k.clone(), MetaValue::from_json(v.clone())))
                            .collect()
                    })
                    .unwrap_or_default();

                let record = svc.swarm.register(RegisterRequest {
                    agent_id: args.string("agent_id")?,
                    machine_id,
                    role: args.string("role")?,
                    capabilities: args.string_list("capabilities").into_iter().collect(),
                    metadata,
                    max_workload: args.opt_int("max_workload").map(|v| v.max(0) as u32),
                });

                // Broadcast targeting needs the session to know its role.
                if let Some(session_id) = ctx.session_id {
                    svc.sessions.set_agent_role(session_id, &record.role);
                }

                // Durability mirror; failure degrades restart recovery only.
                let caps: Vec<String> = record.capabilities.iter().cloned().collect();
                if let Err(e) = svc.backup.db().record_agent(
                    &record.agent_id,
                    &record.machine_id,
                    &record.role,
                    &caps,
                    record.registered_at,
                    record.last_seen,
                ) {
                    warn!(agent = %record.agent_id, error = %e, "agent durability write failed");
                }

                to_json(&record)
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "get_roster", "List registered agents")
            .param(ParamSpec::with_default("include_inactive", ParamType::Bool, json!(false)))
            .param(ParamSpec::with_default("limit", ParamType::Int, json!(50)))
            .param(ParamSpec::with_default("offset", ParamType::Int, json!(0))),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let page = svc.swarm.roster(RosterRequest {
                    include_inactive: args.bool("include_inactive")?,
                    limit: args.int("limit")?.max(0) as usize,
                    offset: args.int("offset")?.max(0) as usize,
                });
                to_json(&page)
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "delegate_task", "Assign a task to the best-matching agent")
            .param(ParamSpec::required("task", ParamType::String))
            .param(ParamSpec::optional("required_capabilities", ParamType::List))
            .param(ParamSpec::optional("target_agent", ParamType::String))
            .param(ParamSpec::optional("priority", ParamType::String))
            .param(ParamSpec::optional("deadline", ParamType::Int)),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let delegation = svc
                    .swarm
                    .delegate(DelegateRequest {
                        task: args.string("task")?,
                        required_capabilities: args
                            .string_list("required_capabilities")
                            .into_iter()
                            .collect(),
                        target_agent: args.opt_str("target_agent").map(str::to_string),
                        priority: args.opt_str("priority").map(str::to_string),
                        deadline: args.opt_int("deadline"),
                    })
                    .map_err(swarm_err)?;

                // The task memory makes the assignment discoverable.
                let memory = svc
                    .memory
                    .store(StoreRequest {
                        content: format!(
                            "Task for {}: {} (priority {})",
                            delegation.assignee,
                            delegation.task,
                            delegation.priority.as_deref().unwrap_or("normal"),
                        ),
                        category: MemoryCategory::Directives,
                        scope: MemoryScope::Global,
                        tags: vec![
                            "task".into(),
                            delegation.task_id.to_hex(),
                            delegation.assignee.clone(),
                        ],
                        metadata: Default::default(),
                        context: Some("task delegation".into()),
                        machine_id: svc.machine_id.clone(),
                        agent_id: delegation.assignee.clone(),
                        project: None,
                    })
                    .await
                    .map_err(memory_err)?;

                if let Err(e) = svc.backup.db().record_task(&AgentTaskRow {
                    task_id: delegation.task_id,
                    task: delegation.task.clone(),
                    assignee: delegation.assignee.clone(),
                    priority: delegation.priority.clone(),
                    deadline: delegation.deadline,
                    delegated_at: delegation.delegated_at,
                    status: "assigned".into(),
                }) {
                    warn!(task = %delegation.task_id, error = %e, "task durability write failed");
                }

                let mut body = to_json(&delegation)?;
                if let Some(map) = body.as_object_mut() {
                    map.insert("task_memory_id".into(), json!(memory.to_hex()));
                }
                Ok(body)
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "release_task", "Release one unit of an agent's workload")
            .param(ParamSpec::required("agent_id", ParamType::String)),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let remaining = svc
                    .swarm
                    .release(args.str("agent_id")?)
                    .map_err(swarm_err)?;
                Ok(json!({"current_workload": remaining}))
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "broadcast_message", "Fan a message out to active drones")
            .param(ParamSpec::required("message", ParamType::String))
            .param(ParamSpec::with_default("category", ParamType::String, json!("general")))
            .param(ParamSpec::with_default("severity", ParamType::String, json!("info")))
            .param(ParamSpec::optional("target_roles", ParamType::List))
            .param(ParamSpec::with_default("source_agent", ParamType::String, json!("hub"))),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let severity = Severity::from_str(args.str("severity")?).map_err(|_| {
                    HubError::BadArgument(format!(
                        "unknown severity '{}'",
                        args.str("severity").unwrap_or_default()
                    ))
                })?;
                let roles = args.string_list("target_roles");
                let target_roles = if roles.is_empty() {
                    None
                } else {
                    Some(roles.into_iter().collect())
                };

                let broadcast = svc.bus.publish(
                    args.string("source_agent")?,
                    svc.machine_id.clone(),
                    args.string("category")?,
                    severity,
                    args.string("message")?,
                    target_roles,
                );
                Ok(json!({
                    "broadcast_id": broadcast.broadcast_id,
                    "created_at": broadcast.created_at,
                }))
            }
        },
    )?;

    Ok(())
}
