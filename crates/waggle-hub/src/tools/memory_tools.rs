//! Collective-memory tools.

use std::str::FromStr;
use std::sync::Arc;

use serde_json::json;

use waggle_memory::{RecentRequest, SearchRequest, StoreRequest};
use waggle_tools::registry::RegistryError;
use waggle_tools::{Args, ParamSpec, ParamType, ToolRegistry};
use waggle_types::{HubError, HubResult, MemoryCategory, MemoryId, MemoryScope, MetaValue};

use super::{memory_err, spec, to_json, Services};
use crate::config::ToolSection;

pub(super) fn register(
    registry: &mut ToolRegistry,
    services: &Arc<Services>,
    section: &ToolSection,
) -> Result<(), RegistryError> {
    let svc = services.clone();
    registry.register_fn(
        spec(section, "store_memory", "Store one item in the collective memory")
            .param(ParamSpec::required("content", ParamType::String))
            .param(ParamSpec::with_default("category", ParamType::String, json!("global")))
            .param(ParamSpec::with_default("scope", ParamType::String, json!("global")))
            .param(ParamSpec::optional("tags", ParamType::List))
            .param(ParamSpec::optional("metadata", ParamType::Map))
            .param(ParamSpec::optional("context", ParamType::String))
            .param(ParamSpec::optional("project", ParamType::String))
            .param(ParamSpec::with_default("agent_id", ParamType::String, json!("unknown"))),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let metadata = args
                    .map("metadata")
                    .map(|m| {
                        m.iter()
                            .map(|(k, v)| (k.clone(), MetaValue::from_json(v.clone())))
                            .collect()
                    })
                    .unwrap_or_default();
                let request = StoreRequest {
                    content: args.string("content")?,
                    category: parse_category(args.str("category")?)?,
                    scope: parse_scope(args.str("scope")?)?,
                    tags: args.string_list("tags"),
                    metadata,
                    context: args.opt_str("context").map(str::to_string),
                    machine_id: svc.machine_id.clone(),
                    agent_id: args.string("agent_id")?,
                    project: args.opt_str("project").map(str::to_string),
                };
                let id = svc.memory.store(request).await.map_err(memory_err)?;
                Ok(json!(id.to_hex()))
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "retrieve_memory", "Fetch one memory by id")
            .param(ParamSpec::required("memory_id", ParamType::String)),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let id = parse_memory_id(args.str("memory_id")?)?;
                match svc.memory.retrieve(id) {
                    Some(item) => to_json(&item),
                    None => Ok(serde_json::Value::Null),
                }
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "search_memories", "Search the collective memory")
            .param(ParamSpec::required("query", ParamType::String))
            .param(ParamSpec::optional("category", ParamType::String))
            .param(ParamSpec::optional("scope", ParamType::String))
            .param(ParamSpec::with_default("include_global", ParamType::Bool, json!(true)))
            .param(ParamSpec::optional("machine_filter_in", ParamType::List))
            .param(ParamSpec::optional("machine_filter_out", ParamType::List))
            .param(ParamSpec::optional("user_id", ParamType::String))
            .param(ParamSpec::with_default("semantic", ParamType::Bool, json!(true)))
            .param(ParamSpec::with_default("limit", ParamType::Int, json!(20)))
            .param(ParamSpec::with_default("offset", ParamType::Int, json!(0))),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let request = search_request(&args)?;
                let page = svc.memory.search(request).await.map_err(memory_err)?;
                to_json(&page)
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "recent_memories", "Memories stored in the last N hours")
            .param(ParamSpec::with_default("hours", ParamType::Int, json!(24)))
            .param(ParamSpec::optional("category", ParamType::String))
            .param(ParamSpec::optional("user_id", ParamType::String))
            .param(ParamSpec::with_default("limit", ParamType::Int, json!(20))),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let request = RecentRequest {
                    hours: args.int("hours")?,
                    category: opt_category(&args)?,
                    user_id: args.opt_str("user_id").map(str::to_string),
                    limit: args.int("limit")?.max(0) as usize,
                };
                let items = svc.memory.recent(request).map_err(memory_err)?;
                to_json(&items)
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "delete_memory", "Tombstone one memory")
            .param(ParamSpec::required("memory_id", ParamType::String)),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let id = parse_memory_id(args.str("memory_id")?)?;
                Ok(json!({"deleted": svc.memory.delete(id)}))
            }
        },
    )?;

    Ok(())
}

/// Shared with the admin API, which exposes the same search semantics.
pub(crate) fn search_request(args: &Args) -> HubResult<SearchRequest> {
    Ok(SearchRequest {
        query: args.string("query")?,
        category: opt_category(args)?,
        scope: match args.opt_str("scope") {
            Some(s) => Some(parse_scope(s)?),
            None => None,
        },
        include_global: args.bool("include_global")?,
        machine_filter_in: args.string_list("machine_filter_in"),
        machine_filter_out: args.string_list("machine_filter_out"),
        user_id: args.opt_str("user_id").map(str::to_string),
        semantic: args.bool("semantic")?,
        limit: args.int("limit")?.max(0) as usize,
        offset: args.int("offset")?.max(0) as usize,
    })
}

fn opt_category(args: &Args) -> HubResult<Option<MemoryCategory>> {
    match args.opt_str("category") {
        Some(raw) => Ok(Some(parse_category(raw)?)),
        None => Ok(None),
    }
}

pub(crate) fn parse_category(raw: &str) -> HubResult<MemoryCategory> {
    MemoryCategory::from_str(raw)
        .map_err(|_| HubError::BadArgument(format!("unknown memory category '{raw}'")))
}

fn parse_scope(raw: &str) -> HubResult<MemoryScope> {
    MemoryScope::from_str(raw)
        .map_err(|_| HubError::BadArgument(format!("unknown memory scope '{raw}'")))
}

pub(crate) fn parse_memory_id(raw: &str) -> HubResult<MemoryId> {
    MemoryId::parse(raw).map_err(|_| HubError::BadArgument(format!("invalid memory id '{raw}'")))
}
