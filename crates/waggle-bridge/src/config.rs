//! Bridge declarations and local discovery.
//!
//! Bridges are declared in a JSON document, either alongside the hub config
//! or dropped into the config directory as `bridges.json`:
//!
//! ```json
//! {
//!     "servers": {
//!         "git": { "command": "uvx", "args": ["mcp-server-git"] },
//!         "search": { "transport": "http_sse", "url": "http://localhost:8931" },
//!         "scratch": { "command": "/bin/scratch-mcp", "enabled": false }
//!     }
//! }
//! ```
//!
//! Disabled entries are skipped. Discovery only parses and returns candidate
//! configs; registration stays an explicit step.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Transport used to reach a bridge server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeTransport {
    /// Child process speaking MCP over stdio.
    #[default]
    Stdio,
    /// Remote streamable-HTTP endpoint.
    HttpSse,
}

/// Declaration of one bridge server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Hub-visible identifier, unique across bridges.
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub transport: BridgeTransport,
    /// Command to spawn (stdio).
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    /// Endpoint URL (http_sse).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl BridgeConfig {
    /// Basic shape check before registration.
    pub fn validate(&self) -> Result<(), String> {
        if self.server_id.is_empty() {
            return Err("bridge server_id must not be empty".into());
        }
        match self.transport {
            BridgeTransport::Stdio if self.command.is_empty() => {
                Err(format!("bridge '{}' needs a command for stdio", self.server_id))
            }
            BridgeTransport::HttpSse if self.url.is_none() => {
                Err(format!("bridge '{}' needs a url for http_sse", self.server_id))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Deserialize)]
struct BridgeFile {
    #[serde(default)]
    servers: BTreeMap<String, BridgeConfig>,
}

/// Parse one bridge declaration document.
pub fn parse_bridge_file(text: &str) -> Result<Vec<BridgeConfig>, serde_json::Error> {
    let file: BridgeFile = serde_json::from_str(text)?;
    Ok(file
        .servers
        .into_iter()
        .filter(|(_, config)| config.enabled)
        .map(|(name, mut config)| {
            // The map key is the identifier; an inline server_id is ignored.
            config.server_id = name;
            config
        })
        .collect())
}

/// Read every readable declaration file and return candidate configs.
///
/// Unreadable or malformed files are logged and skipped; discovery never
/// fails the caller.
pub fn discover_local_servers(paths: &[impl AsRef<Path>]) -> Vec<BridgeConfig> {
    let mut found = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "bridge file not readable, skipping");
                continue;
            }
        };
        match parse_bridge_file(&text) {
            Ok(mut configs) => {
                debug!(path = %path.display(), count = configs.len(), "discovered bridge declarations");
                found.append(&mut configs);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "malformed bridge file, skipping");
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "servers": {
            "git": { "command": "uvx", "args": ["mcp-server-git"] },
            "search": { "transport": "http_sse", "url": "http://localhost:8931" },
            "off": { "command": "/bin/off", "enabled": false }
        }
    }"#;

    #[test]
    fn test_parse_assigns_ids_and_drops_disabled() {
        let configs = parse_bridge_file(SAMPLE).unwrap();
        let ids: Vec<&str> = configs.iter().map(|c| c.server_id.as_str()).collect();
        assert_eq!(ids, vec!["git", "search"]);

        let git = &configs[0];
        assert_eq!(git.transport, BridgeTransport::Stdio);
        assert_eq!(git.command, "uvx");

        let search = &configs[1];
        assert_eq!(search.transport, BridgeTransport::HttpSse);
        assert_eq!(search.url.as_deref(), Some("http://localhost:8931"));
    }

    #[test]
    fn test_validate() {
        let configs = parse_bridge_file(SAMPLE).unwrap();
        assert!(configs.iter().all(|c| c.validate().is_ok()));

        let bad = BridgeConfig {
            server_id: "x".into(),
            transport: BridgeTransport::HttpSse,
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: None,
            enabled: true,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_discover_skips_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("bridges.json");
        std::fs::File::create(&good)
            .unwrap()
            .write_all(SAMPLE.as_bytes())
            .unwrap();
        let bad = dir.path().join("broken.json");
        std::fs::File::create(&bad)
            .unwrap()
            .write_all(b"{nope")
            .unwrap();
        let missing = dir.path().join("absent.json");

        let configs = discover_local_servers(&[good, bad, missing]);
        assert_eq!(configs.len(), 2);
    }
}
