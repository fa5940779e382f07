//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// HTTP API listen address
    pub http_listen: String,

    /// Address other nodes should reach us on, when it differs from
    /// `http_listen` (e.g. listening on 0.0.0.0)
    pub advertise_address: Option<String>,

    /// UDP discovery port
    pub discovery_port: u16,

    /// Node display name, defaults to the hostname
    pub node_name: Option<String>,

    /// Base domain for the derived DNS zone
    pub base_domain: String,

    /// Health monitoring
    pub health: HealthConfig,

    /// Registry behavior
    pub registry: RegistryConfig,

    /// Backup and broadcast fan-out
    pub fanout: FanoutConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            store_path: meshhub_common::default_store_path(),
            http_listen: "0.0.0.0:8787".to_string(),
            advertise_address: None,
            discovery_port: 47700,
            node_name: None,
            base_domain: "mesh.local".to_string(),
            health: HealthConfig::default(),
            registry: RegistryConfig::default(),
            fanout: FanoutConfig::default(),
        }
    }
}

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Base probe interval in seconds
    pub interval_seconds: u64,

    /// Jitter applied to each probe interval, as a fraction of the interval
    pub jitter_fraction: f64,

    /// Consecutive failed probes before a peer is marked offline
    pub offline_threshold: u32,

    /// Per-probe timeout in seconds
    pub probe_timeout_seconds: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            jitter_fraction: 0.2,
            offline_threshold: 3,
            probe_timeout_seconds: 5,
        }
    }
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Default cache TTL in seconds for new entries
    pub default_ttl_seconds: u64,

    /// Zone TTL written into the derived zone
    pub zone_ttl_seconds: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 300,
            zone_ttl_seconds: 300,
        }
    }
}

/// Timeouts for operations fanned out across peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Per-target timeout for backup pushes, in seconds
    pub backup_timeout_seconds: u64,

    /// Per-target timeout for broadcast commands, in seconds
    pub broadcast_timeout_seconds: u64,

    /// Discovery probe collection window, in seconds
    pub discovery_timeout_seconds: u64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            backup_timeout_seconds: 60,
            broadcast_timeout_seconds: 15,
            discovery_timeout_seconds: 3,
        }
    }
}

impl MeshConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }

    /// Address announced to peers
    pub fn advertise_address(&self) -> String {
        self.advertise_address
            .clone()
            .unwrap_or_else(|| self.http_listen.clone())
    }

    /// Node name, falling back to the hostname then a fixed string
    pub fn node_name(&self) -> String {
        if let Some(name) = &self.node_name {
            return name.clone();
        }
        std::env::var("HOSTNAME").unwrap_or_else(|_| "meshhub-node".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let config = MeshConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: MeshConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.discovery_port, 47700);
        assert_eq!(back.registry.default_ttl_seconds, 300);
        assert_eq!(back.health.offline_threshold, 3);
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = MeshConfig::load(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.http_listen, "0.0.0.0:8787");
    }
}
