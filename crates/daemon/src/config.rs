//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// ID of this node as it appears in network definitions
    pub node_id: String,

    /// WireGuard key storage
    pub key_dir: PathBuf,

    /// Host-wide namespace with the public uplink, if the node has one
    pub public_namespace: String,

    /// JSON network definitions to apply
    pub network_files: Vec<PathBuf>,

    /// MTU of the veth pairs
    pub mtu: u16,

    /// Host backend configuration
    pub backend: BackendConfig,

    /// Retry configuration
    pub retry: RetryConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            key_dir: nrmesh_common::default_key_dir(),
            public_namespace: nrmesh_common::provision::PUBLIC_NAMESPACE.to_string(),
            network_files: Vec::new(),
            mtu: nrmesh_common::provision::DEFAULT_MTU,
            backend: BackendConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Command paths for the host backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Path to the iproute2 `ip` binary
    pub ip_path: String,

    /// Path to the `wg` binary
    pub wg_path: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            ip_path: "ip".to_string(),
            wg_path: "wg".to_string(),
        }
    }
}

/// How often a failed network is re-attempted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per network, including the first
    pub attempts: u32,

    /// Delay between attempts
    pub delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_secs: 5,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_id.is_empty() {
            anyhow::bail!("node_id is not set");
        }
        if self.mtu < 1280 {
            anyhow::bail!("mtu {} is below the IPv6 minimum of 1280", self.mtu);
        }
        if self.retry.attempts == 0 {
            anyhow::bail!("retry.attempts must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = DaemonConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.public_namespace, "public");
        assert_eq!(config.mtu, 1500);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nrmesh.toml");
        std::fs::write(
            &path,
            "node_id = \"node-b\"\nnetwork_files = [\"/etc/nrmesh/mesh.json\"]\n\n[backend]\nwg_path = \"/usr/bin/wg\"\n",
        )
        .unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.node_id, "node-b");
        assert_eq!(config.backend.wg_path, "/usr/bin/wg");
        assert_eq!(config.backend.ip_path, "ip");
        assert_eq!(config.retry.attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf/nrmesh.toml");
        let config = DaemonConfig {
            node_id: "node-a".into(),
            mtu: 1420,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(DaemonConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_empty_node() {
        assert!(DaemonConfig::default().validate().is_err());
    }
}
