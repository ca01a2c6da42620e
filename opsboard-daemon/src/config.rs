//! Configuration management for the daemon.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use opsboard_core::StatusSettings;
use opsboard_proxmox::ProxmoxSettings;

use crate::cli::Args;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cluster connection configuration
    pub proxmox: ProxmoxConfig,
    /// Live status refresher configuration
    pub status: StatusConfig,
    /// Host inventory storage configuration
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref node) = args.default_node {
            self.status.default_node = node.clone();
        }
        if let Some(ref store) = args.store {
            self.store.path = store.clone();
        }
        self
    }
}

/// Cluster connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxmoxConfig {
    /// API base URL, e.g. `https://pve.example:8006/api2/json`
    pub base_url: String,
    /// API token id, e.g. `ops@pam!board`
    pub token_id: String,
    /// API token secret
    pub token_secret: String,
    /// Default wait for remote calls, in seconds (floored to 30 per call)
    pub default_wait_secs: u64,
    /// Accept self-signed cluster certificates
    pub insecure_tls: bool,
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            base_url: "https://localhost:8006/api2/json".to_string(),
            token_id: String::new(),
            token_secret: String::new(),
            default_wait_secs: 30,
            insecure_tls: false,
        }
    }
}

impl ProxmoxConfig {
    pub fn to_settings(&self) -> ProxmoxSettings {
        ProxmoxSettings {
            base_url: self.base_url.clone(),
            token_id: self.token_id.clone(),
            token_secret: self.token_secret.clone(),
            default_wait: Duration::from_secs(self.default_wait_secs),
            insecure_tls: self.insecure_tls,
        }
    }
}

/// Live status refresher configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Seconds between inventory sweeps
    pub refresh_secs: u64,
    /// Capture a top-process sample for running hosts
    pub capture_top: bool,
    /// Minimum seconds between captures per host (floored to 30)
    pub capture_interval_secs: u64,
    /// Persist `last_seen` on records observed running
    pub touch_last_seen: bool,
    /// Node assumed for records that store no node
    pub default_node: String,
    /// Hostnames treated as the daemon's own machine
    pub local_hosts: Vec<String>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            refresh_secs: 30,
            capture_top: false,
            capture_interval_secs: 120,
            touch_last_seen: false,
            default_node: "pve".to_string(),
            local_hosts: Vec::new(),
        }
    }
}

impl StatusConfig {
    pub fn to_settings(&self) -> StatusSettings {
        StatusSettings {
            refresh_interval: Duration::from_secs(self.refresh_secs.max(1)),
            capture_top: self.capture_top,
            capture_interval: Duration::from_secs(self.capture_interval_secs),
            touch_last_seen: self.touch_last_seen,
            default_node: self.default_node.clone(),
            local_hosts: self.local_hosts.clone(),
        }
    }
}

/// Host inventory storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the JSON inventory file
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "/var/lib/opsboard/hosts.json".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.status.refresh_secs, 30);
        assert!(!config.status.capture_top);
        assert_eq!(config.store.path, "/var/lib/opsboard/hosts.json");
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let config: Config = serde_yaml::from_str(
            r#"
proxmox:
  base_url: https://pve1:8006/api2/json
  token_id: ops@pam!board
status:
  capture_top: true
"#,
        )
        .unwrap();
        assert_eq!(config.proxmox.base_url, "https://pve1:8006/api2/json");
        assert!(config.status.capture_top);
        assert_eq!(config.status.refresh_secs, 30);
    }

    #[test]
    fn cli_overrides_win() {
        use clap::Parser;
        let args =
            crate::cli::Args::parse_from(["opsboard", "--default-node", "pve9", "--store", "/tmp/h.json"]);
        let config = Config::default().with_cli_overrides(&args);
        assert_eq!(config.status.default_node, "pve9");
        assert_eq!(config.store.path, "/tmp/h.json");
    }
}
