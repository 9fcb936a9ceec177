//! Bridge tools: registration, discovery, proxying.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use waggle_bridge::{discover_local_servers, BridgeConfig, BridgeTransport};
use waggle_tools::registry::RegistryError;
use waggle_tools::{ParamSpec, ParamType, ToolRegistry};
use waggle_types::HubError;

use super::{bridge_err, spec, to_json, Services};
use crate::config::ToolSection;

pub(super) fn register(
    registry: &mut ToolRegistry,
    services: &Arc<Services>,
    section: &ToolSection,
) -> Result<(), RegistryError> {
    let svc = services.clone();
    registry.register_fn(
        spec(section, "list_bridges", "Registered bridge servers and their tools"),
        move |_ctx, _args| {
            let svc = svc.clone();
            async move { to_json(&svc.bridges.list()) }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "register_bridge", "Register and connect an external tool server")
            .param(ParamSpec::required("server_id", ParamType::String))
            .param(ParamSpec::with_default("transport", ParamType::String, json!("stdio")))
            .param(ParamSpec::optional("command", ParamType::String))
            .param(ParamSpec::optional("args", ParamType::List))
            .param(ParamSpec::optional("env", ParamType::Map))
            .param(ParamSpec::optional("cwd", ParamType::String))
            .param(ParamSpec::optional("url", ParamType::String)),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let transport = match args.str("transport")? {
                    "stdio" => BridgeTransport::Stdio,
                    "http_sse" => BridgeTransport::HttpSse,
                    other => {
                        return Err(HubError::BadArgument(format!(
                            "unknown bridge transport '{other}'"
                        )));
                    }
                };
                let env: HashMap<String, String> = args
                    .map("env")
                    .map(|m| {
                        m.iter()
                            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                            .collect()
                    })
                    .unwrap_or_default();

                let config = BridgeConfig {
                    server_id: args.string("server_id")?,
                    transport,
                    command: args.opt_str("command").unwrap_or_default().to_string(),
                    args: args.string_list("args"),
                    env,
                    cwd: args.opt_str("cwd").map(str::to_string),
                    url: args.opt_str("url").map(str::to_string),
                    enabled: true,
                };
                let info = svc.bridges.register(config).await.map_err(bridge_err)?;
                to_json(&info)
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "unregister_bridge", "Disconnect and forget a bridge server")
            .param(ParamSpec::required("server_id", ParamType::String)),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                svc.bridges
                    .unregister(args.str("server_id")?)
                    .map_err(bridge_err)?;
                Ok(json!({"unregistered": true}))
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "discover_bridges", "Scan local declaration files for bridge candidates"),
        move |_ctx, _args| {
            let svc = svc.clone();
            async move {
                let found = discover_local_servers(&svc.bridge_discovery_paths);
                to_json(&found)
            }
        },
    )?;

    let svc = services.clone();
    registry.register_fn(
        spec(section, "bridge_call", "Proxy a tool call to a bridge server")
            .param(ParamSpec::required("server_id", ParamType::String))
            .param(ParamSpec::required("tool", ParamType::String))
            .param(ParamSpec::optional("params", ParamType::Map)),
        move |_ctx, args| {
            let svc = svc.clone();
            async move {
                let params = args
                    .map("params")
                    .map(|m| serde_json::Value::Object(m.clone()))
                    .unwrap_or_else(|| json!({}));
                let output = svc
                    .bridges
                    .proxy(args.str("server_id")?, args.str("tool")?, params)
                    .await
                    .map_err(bridge_err)?;
                if output.is_error {
                    return Err(HubError::Tool(output.text));
                }
                Ok(json!(output.text))
            }
        },
    )?;

    Ok(())
}
