//! Hub configuration.
//!
//! Loaded from `--config`, else `CONFIG_PATH`, else `config/config.json`
//! relative to the working directory. A missing file means built-in
//! defaults; a present-but-malformed file is a startup error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use waggle_bridge::BridgeConfig;
use waggle_backup::DriftPattern;

/// Fallback config location relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/config.json";

/// Top-level hub configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub server: ServerSection,
    pub memory: MemorySection,
    pub sessions: SessionSection,
    pub tools: ToolSection,
    pub swarm: SwarmSection,
    pub bridges: BridgeSection,
    pub backup: BackupSection,
    pub tickets: TicketSection,
    pub auth: AuthSection,
    pub security: SecuritySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Defaults to the machine's hostname.
    pub machine_id: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8900,
            machine_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// Embedding vector width for the built-in embedder.
    pub embedding_dim: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self { embedding_dim: 256 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub max_sessions: usize,
    pub idle_ttl_s: u64,
    /// Outbound frame buffer per session.
    pub buffer_frames: usize,
    /// How long a producer may block on a full session buffer.
    pub send_timeout_s: u64,
    /// How long a terminated session stays in the table.
    pub grace_s: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_sessions: 10_000,
            idle_ttl_s: 300,
            buffer_frames: 1024,
            send_timeout_s: 5,
            grace_s: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSection {
    pub deadline_s: u64,
    pub output_limit: usize,
}

impl Default for ToolSection {
    fn default() -> Self {
        Self {
            deadline_s: 30,
            output_limit: waggle_tools::DEFAULT_OUTPUT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmSection {
    pub liveness_window_s: u64,
    pub broadcast_replay: usize,
}

impl Default for SwarmSection {
    fn default() -> Self {
        Self {
            liveness_window_s: 300,
            broadcast_replay: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSection {
    pub inflight_cap: usize,
    pub proxy_deadline_s: u64,
    pub health_interval_s: u64,
    /// Bridges registered at startup; the map key is the server id.
    pub servers: BTreeMap<String, BridgeConfig>,
    /// Extra declaration files scanned by discovery.
    pub discovery_paths: Vec<PathBuf>,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            inflight_cap: 64,
            proxy_deadline_s: 30,
            health_interval_s: 60,
            servers: BTreeMap::new(),
            discovery_paths: vec![PathBuf::from("config/bridges.json")],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSection {
    /// SQLite path; in-memory when unset.
    pub db_path: Option<PathBuf>,
    pub drift_threshold: f64,
    /// Replacement drift-pattern table; built-in defaults when unset.
    pub drift_patterns: Option<Vec<DriftPattern>>,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            db_path: None,
            drift_threshold: waggle_backup::DEFAULT_DRIFT_THRESHOLD,
            drift_patterns: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketSection {
    /// SQLite path for the local board; in-memory when unset.
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// HMAC secret for bearer tokens; a random one is minted when unset
    /// (tokens then expire on restart).
    pub token_secret: Option<String>,
    pub token_ttl_s: u64,
    pub admin_username: String,
    /// Hex sha-256 of the admin password. Login is disabled when unset.
    pub admin_password_sha256: Option<String>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            token_secret: None,
            token_ttl_s: 12 * 3600,
            admin_username: "admin".into(),
            admin_password_sha256: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    pub tls: TlsSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSection {
    pub enabled: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl HubConfig {
    /// Resolve and load the configuration.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var_os("CONFIG_PATH")
                .map(PathBuf::from)
                .or_else(|| Some(PathBuf::from(DEFAULT_CONFIG_PATH))),
        };

        match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(&path)?;
                let config: HubConfig = serde_json::from_str(&text)
                    .map_err(|e| anyhow::anyhow!("malformed config {}: {e}", path.display()))?;
                Ok(config)
            }
            Some(path) if explicit.is_some() => {
                anyhow::bail!("config file not found: {}", path.display())
            }
            _ => Ok(Self::default()),
        }
    }

    /// Machine identity: configured value or the hostname.
    pub fn machine_id(&self) -> String {
        self.server
            .machine_id
            .clone()
            .or_else(|| {
                hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
            })
            .unwrap_or_else(|| "unknown-machine".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.server.port, 8900);
        assert_eq!(config.sessions.max_sessions, 10_000);
        assert_eq!(config.tools.output_limit, 80_000);
        assert!(!config.security.tls.enabled);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(br#"{"server": {"port": 1234}, "security": {"tls": {"enabled": true}}}"#)
            .unwrap();

        let config = HubConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 1234);
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(config.security.tls.enabled);
    }

    #[test]
    fn test_explicit_missing_file_errors() {
        assert!(HubConfig::load(Some(Path::new("/definitely/not/here.json"))).is_err());
    }

    #[test]
    fn test_machine_id_fallback() {
        let config = HubConfig::default();
        assert!(!config.machine_id().is_empty());
    }
}
