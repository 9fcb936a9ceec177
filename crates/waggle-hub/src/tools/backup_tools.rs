//! Config backup tools.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use waggle_tools::registry::RegistryError;
use waggle_tools::{ParamSpec, ParamType, ToolRegistry};
use waggle_types::{AlertId, DiffId, HubError, HubResult, SnapshotId};

use super::{backup_err, spec, to_json, Services};
use crate::config::ToolSection;

pub(super) fn register(
    registry: &mut ToolRegistry,
    services: &Arc<Services>,
    section: &ToolSection,
) -> Result<(), RegistryError> {
    let svc = services.clone();
    registry.register_fn(
        spec(section, "register_config_system", "Register a system for config backups")
            .param(ParamSpec::required("system_id", ParamType::String))
            .param(ParamSpec::optional("name", ParamType::String))
            .param(ParamSpec::with_default("type", ParamType::String, json!("generic")))
            .param(ParamSpec::optional("backup_frequency_s", ParamType::Int))
            .param(ParamSpec::optional("metadata", ParamType::Map)),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let system_id = args.string("system_id")?;
                let name = args
                    .opt_str("name")
                    .map(str::to_string)
                    .unwrap_or_else(|| system_id.clone());
                let metadata = args
                    .map("metadata")
                    .map(|m| {
                        m.iter()
                            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                            .collect()
                    })
                    .unwrap_or_default();
                let system = svc
                    .backup
                    .register_system(
                        &system_id,
                        &name,
                        args.str("type")?,
                        args.opt_int("backup_frequency_s"),
                        metadata,
                    )
                    .map_err(backup_err)?;
                to_json(&system)
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "create_snapshot", "Snapshot a system's config (deduplicated)")
            .param(ParamSpec::required("system_id", ParamType::String))
            .param(ParamSpec::required("content", ParamType::String))
            .param(ParamSpec::with_default("type", ParamType::String, json!("config")))
            .param(ParamSpec::optional("file_path", ParamType::String))
            .param(ParamSpec::with_default("agent_id", ParamType::String, json!("unknown")))
            .param(ParamSpec::optional("tags", ParamType::List)),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let outcome = svc
                    .backup
                    .create_snapshot(
                        args.str("system_id")?,
                        args.str("content")?,
                        args.str("type")?,
                        args.opt_str("file_path"),
                        args.str("agent_id")?,
                        args.string_list("tags"),
                    )
                    .map_err(backup_err)?;
                to_json(&outcome)
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "list_snapshots", "Snapshots for a system, newest first")
            .param(ParamSpec::required("system_id", ParamType::String))
            .param(ParamSpec::with_default("limit", ParamType::Int, json!(20))),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let snapshots = svc
                    .backup
                    .list_snapshots(args.str("system_id")?, args.int("limit")?.max(0) as usize)
                    .map_err(backup_err)?;
                to_json(&snapshots)
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "get_config_diff", "Fetch one config diff by id")
            .param(ParamSpec::required("diff_id", ParamType::String)),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let id = parse_diff_id(args.str("diff_id")?)?;
                match svc.backup.get_diff(id).map_err(backup_err)? {
                    Some(diff) => to_json(&diff),
                    None => Ok(serde_json::Value::Null),
                }
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "detect_drift", "Risky config diffs inside a time window")
            .param(ParamSpec::optional("system_id", ParamType::String))
            .param(ParamSpec::with_default("hours_back", ParamType::Int, json!(24))),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let findings = svc
                    .backup
                    .detect_drift(args.opt_str("system_id"), args.int("hours_back")?)
                    .map_err(backup_err)?;
                to_json(&findings)
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "get_alerts", "Drift alerts for a system")
            .param(ParamSpec::optional("system_id", ParamType::String))
            .param(ParamSpec::with_default(
                "include_acknowledged",
                ParamType::Bool,
                json!(false),
            )),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let alerts = svc
                    .backup
                    .get_alerts(args.opt_str("system_id"), args.bool("include_acknowledged")?)
                    .map_err(backup_err)?;
                to_json(&alerts)
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "acknowledge_alert", "Mark a drift alert as handled")
            .param(ParamSpec::required("alert_id", ParamType::String)),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let raw = args.str("alert_id")?;
                let id = AlertId::parse(raw)
                    .map_err(|_| HubError::BadArgument(format!("invalid alert id '{raw}'")))?;
                let acknowledged = svc.backup.acknowledge_alert(id).map_err(backup_err)?;
                Ok(json!({"acknowledged": acknowledged}))
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "restore_snapshot", "Restore a snapshot's content, appending to the audit trail")
            .param(ParamSpec::required("snapshot_id", ParamType::String))
            .param(ParamSpec::optional("target_path", ParamType::String))
            .param(ParamSpec::with_default("agent_id", ParamType::String, json!("unknown"))),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let id = parse_snapshot_id(args.str("snapshot_id")?)?;
                let target = args.opt_str("target_path").map(PathBuf::from);
                let outcome = svc
                    .backup
                    .restore(id, target.as_deref(), args.str("agent_id")?)
                    .map_err(backup_err)?;
                to_json(&outcome)
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "get_current_config", "Latest snapshot content for a system")
            .param(ParamSpec::required("system_id", ParamType::String)),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let snapshot = svc
                    .backup
                    .get_current_config(args.str("system_id")?)
                    .map_err(backup_err)?;
                to_json(&snapshot)
            }
        },
    )?;

    Ok(())
}

fn parse_snapshot_id(raw: &str) -> HubResult<SnapshotId> {
    SnapshotId::parse(raw)
        .map_err(|_| HubError::BadArgument(format!("invalid snapshot id '{raw}'")))
}

fn parse_diff_id(raw: &str) -> HubResult<DiffId> {
    DiffId::parse(raw).map_err(|_| HubError::BadArgument(format!("invalid diff id '{raw}'")))
}
