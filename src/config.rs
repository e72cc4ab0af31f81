//! P2PSync Configuration
//!
//! This module provides configuration structures for a P2PSync node.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::replication::ReplicationConfig;
use crate::state::PeerAddress;

/// Main P2PSync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2PSyncConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Operation log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// State store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Host other peers use to reach this node
    pub host: String,

    /// Port for peer communication
    pub port: u16,

    /// Address to bind the peer listener on (defaults to host:port)
    #[serde(default)]
    pub bind_address: Option<String>,

    /// Data directory for the operation log and state store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Operation log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Use fsync for durability (slower but safer)
    #[serde(default = "default_true")]
    pub fsync: bool,

    /// Enable LZ4 compression for log records
    #[serde(default)]
    pub compression: bool,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Peers to catch up from when joining, tried in order.
    /// Empty means this node starts a new network.
    #[serde(default)]
    pub bootstrap: Vec<String>,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Time to wait for a heartbeat response in milliseconds
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Consecutive failed probes before a peer is declared unreachable
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Which state store backs `apply`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

/// State store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_heartbeat_timeout_ms() -> u64 {
    500
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Sqlite
}

fn default_api_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/p2psync")
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            fsync: true,
            compression: false,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl P2PSyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: P2PSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.host.is_empty() {
            return Err(crate::Error::Config("node.host cannot be empty".into()));
        }

        if self.node.port == 0 {
            return Err(crate::Error::Config("node.port cannot be 0".into()));
        }

        if self.cluster.failure_threshold == 0 {
            return Err(crate::Error::Config(
                "cluster.failure_threshold must be at least 1".into(),
            ));
        }

        if self.cluster.heartbeat_interval_ms == 0 || self.cluster.heartbeat_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "cluster heartbeat interval and timeout must be positive".into(),
            ));
        }

        let local = self.local_address();
        for peer in self.bootstrap_peers()? {
            if peer == local {
                return Err(crate::Error::Config(format!(
                    "cluster.bootstrap contains this node's own address {}",
                    peer
                )));
            }
        }

        Ok(())
    }

    /// Address other peers use to reach this node
    pub fn local_address(&self) -> PeerAddress {
        PeerAddress::new(self.node.host.clone(), self.node.port)
    }

    /// Address to bind the peer listener on
    pub fn bind_address(&self) -> String {
        self.node
            .bind_address
            .clone()
            .unwrap_or_else(|| self.local_address().to_string())
    }

    /// Parsed bootstrap peers, in configured order
    pub fn bootstrap_peers(&self) -> crate::Result<Vec<PeerAddress>> {
        self.cluster
            .bootstrap
            .iter()
            .map(|s| s.parse::<PeerAddress>())
            .collect()
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the state store database path
    pub fn store_path(&self) -> PathBuf {
        self.node.data_dir.join("store.db")
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }

    /// Get heartbeat timeout as Duration
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_timeout_ms)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.connect_timeout_ms)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.request_timeout_ms)
    }

    /// Build the replication settings for the engine
    pub fn replication_config(&self) -> ReplicationConfig {
        ReplicationConfig {
            heartbeat_interval: self.heartbeat_interval(),
            heartbeat_timeout: self.heartbeat_timeout(),
            failure_threshold: self.cluster.failure_threshold,
            ..ReplicationConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
host = "10.0.0.1"
port = 7654
data_dir = "/var/lib/p2psync"

[log]
fsync = false
compression = true

[cluster]
bootstrap = ["10.0.0.2:7654", "10.0.0.3:7654"]
heartbeat_interval_ms = 250
failure_threshold = 5

[store]
backend = "memory"
"#;

        let config = P2PSyncConfig::from_str(toml).unwrap();
        assert_eq!(config.local_address(), PeerAddress::new("10.0.0.1", 7654));
        assert_eq!(config.bind_address(), "10.0.0.1:7654");
        assert_eq!(config.bootstrap_peers().unwrap().len(), 2);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.log.compression);

        let replication = config.replication_config();
        assert_eq!(replication.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(replication.heartbeat_timeout, Duration::from_millis(500));
        assert_eq!(replication.failure_threshold, 5);
    }

    #[test]
    fn test_rejects_self_bootstrap() {
        let toml = r#"
[node]
host = "localhost"
port = 7654

[cluster]
bootstrap = ["localhost:7654"]
"#;
        assert!(P2PSyncConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_rejects_bad_bootstrap_address() {
        let toml = r#"
[node]
host = "localhost"
port = 7654

[cluster]
bootstrap = ["no-port-here"]
"#;
        assert!(matches!(
            P2PSyncConfig::from_str(toml),
            Err(crate::Error::Config(_))
        ));
    }
}
