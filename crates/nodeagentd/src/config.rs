//! Agent process configuration, loaded from JSON with `serde(default)`
//! fallbacks for every optional field — the same shape as the donor's
//! `clawnode::config::NodeConfig`, generalized to the agent side of the
//! CLI/agent split instead of the node/gateway split.

use crate::error::AgentError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

fn default_hostname() -> String {
    "nodeagentd".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:7878".to_string()
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/var/lib/nodeagentd")
}

fn default_key_rotation_secs() -> u64 {
    24 * 60 * 60
}

fn default_shutdown_drain_secs() -> u64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Key rotation cadence. Default 24h.
    #[serde(default = "default_key_rotation_secs")]
    pub key_rotation_interval_secs: u64,

    /// Graceful-shutdown in-flight drain budget. Default 15s.
    #[serde(default = "default_shutdown_drain_secs")]
    pub shutdown_drain_secs: u64,

    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            listen_addr: default_listen_addr(),
            state_path: default_state_path(),
            key_rotation_interval_secs: default_key_rotation_secs(),
            shutdown_drain_secs: default_shutdown_drain_secs(),
            labels: HashMap::new(),
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), AgentError> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        nc_persist::atomic_write(path, json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_runnable() {
        let config = AgentConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:7878");
        assert_eq!(config.key_rotation_interval_secs, 86_400);
        assert_eq!(config.shutdown_drain_secs, 15);
        assert!(config.labels.is_empty());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        let config = AgentConfig {
            hostname: "node-a".to_string(),
            state_path: dir.path().to_path_buf(),
            ..AgentConfig::default()
        };
        config.save(&config_path).unwrap();
        let loaded = AgentConfig::load(&config_path).unwrap();
        assert_eq!(loaded.hostname, "node-a");
        assert_eq!(loaded.state_path, dir.path());
    }

    #[test]
    fn load_missing_file_errors() {
        let result = AgentConfig::load(Path::new("/nonexistent/nodeagentd/config.json"));
        assert!(result.is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, r#"{"hostname": "partial-node"}"#).unwrap();
        let loaded = AgentConfig::load(&config_path).unwrap();
        assert_eq!(loaded.hostname, "partial-node");
        assert_eq!(loaded.listen_addr, "0.0.0.0:7878");
    }
}
