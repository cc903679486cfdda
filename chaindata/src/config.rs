//! Top-level configuration for a data-plane node.
//!
//! This module aggregates configuration for:
//!
//! - storage (data directory + requested block storage policy),
//! - the fee oracle (validity window + refresh cadence),
//! - the metrics exporter (enable flag + listen address).
//!
//! The goal is a single `NodeConfig` struct that binaries can construct
//! from defaults, config files, or environment variables as needed.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::StoragePolicy;

/// Configuration for the storage stack.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory under which `blockchain/` is created.
    pub data_dir: PathBuf,
    /// Requested block storage policy; the database may keep a stronger
    /// previously persisted one.
    pub block_policy: Option<StoragePolicy>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            block_policy: None,
        }
    }
}

/// Configuration for the fee oracle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeeConfig {
    /// How long a fee sample participates in the estimate.
    pub validity: Duration,
    /// How often the estimate is recomputed and republished.
    pub refresh: Duration,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            validity: Duration::from_secs(20 * 60),
            refresh: Duration::from_secs(60),
        }
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether to run a `/metrics` HTTP exporter.
    pub enabled: bool,
    /// Address to bind the metrics HTTP server to.
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        // Safe to unwrap: this is a fixed, valid address literal.
        let addr: SocketAddr = "127.0.0.1:9898"
            .parse()
            .expect("hard-coded metrics listen address should parse");
        Self {
            enabled: true,
            listen_addr: addr,
        }
    }
}

/// Top-level configuration for a data-plane node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub fee: FeeConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl NodeConfig {
    /// Loads configuration from a JSON file. Missing sections fall back to
    /// their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        serde_json::from_str(&raw).map_err(|e| format!("failed to parse {}: {e}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip_preserves_settings() {
        let mut config = NodeConfig::default();
        config.storage.block_policy = Some(StoragePolicy::All);
        config.fee.refresh = Duration::from_secs(30);

        let encoded = serde_json::to_string(&config).expect("serialize");
        let decoded: NodeConfig = serde_json::from_str(&encoded).expect("parse");
        assert_eq!(decoded.storage.block_policy, Some(StoragePolicy::All));
        assert_eq!(decoded.fee.refresh, Duration::from_secs(30));
    }

    #[test]
    fn missing_sections_use_defaults() {
        let decoded: NodeConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(decoded.metrics.enabled, true);
        assert_eq!(decoded.fee.validity, Duration::from_secs(20 * 60));
    }

    #[test]
    fn from_json_file_reads_overrides() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let path = tmp.path().join("node.json");
        std::fs::write(
            &path,
            r#"{"storage": {"data_dir": "/tmp/chains", "block_policy": "Cache"}}"#,
        )
        .expect("write config");

        let config = NodeConfig::from_json_file(&path).expect("load");
        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/chains"));
        assert_eq!(config.storage.block_policy, Some(StoragePolicy::Cache));
    }
}
