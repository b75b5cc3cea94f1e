//! WolfSync Configuration
//!
//! This module provides configuration structures for the WolfSync
//! follower synchronization engine and its leader service.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::inventory::DropPolicy;
use crate::sync::RetryPolicy;

/// Main WolfSync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfSyncConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Leader to synchronize from
    #[serde(default)]
    pub leader: LeaderConfig,

    /// Local document store
    #[serde(default)]
    pub storage: StorageConfig,

    /// Sync behaviour
    #[serde(default)]
    pub sync: SyncConfig,

    /// Retry policy for leader requests
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Leader service configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Data directory for checkpoints and the document store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Leader connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderConfig {
    /// Leader address (host:port)
    #[serde(default)]
    pub address: String,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Enable LZ4 compression for large frames
    #[serde(default = "default_true")]
    pub compression: bool,
}

/// Local document store configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Document store file (defaults to `<data_dir>/documents.db`)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Records per transfer chunk (0 = derive from available RAM)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Sub-ranges per range-checksum request (at least 2)
    #[serde(default = "default_checksum_granularity")]
    pub checksum_granularity: usize,

    /// Ranges with at most this many records are compared key by key
    #[serde(default = "default_checksum_leaf_size")]
    pub checksum_leaf_size: usize,

    /// Collections synced in parallel per database (0 = auto-detect)
    #[serde(default)]
    pub collection_concurrency: usize,

    /// Databases synced in parallel
    #[serde(default = "default_database_concurrency")]
    pub database_concurrency: usize,

    /// Only sync these databases (empty = all on the leader)
    #[serde(default)]
    pub databases: Vec<String>,

    /// Leave collections whose name starts with `_` alone
    #[serde(default)]
    pub skip_system_collections: bool,

    /// What may be dropped or recreated locally
    #[serde(default)]
    pub drop_policy: DropPolicy,
}

/// Leader service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address `wolfsync serve` listens on
    #[serde(default = "default_server_address")]
    pub bind_address: String,
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
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfsync")
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    30000
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    1000
}

fn default_checksum_granularity() -> usize {
    16
}

fn default_checksum_leaf_size() -> usize {
    1000
}

fn default_database_concurrency() -> usize {
    1
}

fn default_server_address() -> String {
    "0.0.0.0:7654".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            compression: true,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            checksum_granularity: default_checksum_granularity(),
            checksum_leaf_size: default_checksum_leaf_size(),
            collection_concurrency: 0,
            database_concurrency: default_database_concurrency(),
            databases: Vec::new(),
            skip_system_collections: false,
            drop_policy: DropPolicy::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_server_address(),
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

impl SyncConfig {
    /// True when `database` passes the allow-list
    pub fn includes_database(&self, database: &str) -> bool {
        self.databases.is_empty() || self.databases.iter().any(|d| d == database)
    }
}

impl WolfSyncConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfSyncConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.sync.checksum_granularity < 2 {
            return Err(crate::Error::Config(
                "sync.checksum_granularity must be at least 2".into(),
            ));
        }

        if self.sync.checksum_leaf_size == 0 {
            return Err(crate::Error::Config(
                "sync.checksum_leaf_size must be positive".into(),
            ));
        }

        if self.retry.multiplier < 1.0 {
            return Err(crate::Error::Config("retry.multiplier must be at least 1.0".into()));
        }

        Ok(())
    }

    /// Validate the settings `wolfsync sync` needs on top of the basics
    pub fn validate_follower(&self) -> crate::Result<()> {
        if self.leader.address.is_empty() {
            return Err(crate::Error::Config("leader.address cannot be empty".into()));
        }
        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the checkpoint directory path
    pub fn state_dir(&self) -> PathBuf {
        self.node.data_dir.join("state")
    }

    /// Get the document store path
    pub fn storage_path(&self) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("documents.db"))
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.leader.connect_timeout_ms)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.leader.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "follower-1"
data_dir = "/var/lib/wolfsync"

[leader]
address = "leader:7654"
request_timeout_ms = 10000

[sync]
chunk_size = 500
databases = ["shop"]

[sync.drop_policy]
drop_extraneous = true

[retry]
max_attempts = 3
"#;

        let config = WolfSyncConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "follower-1");
        assert_eq!(config.leader.address, "leader:7654");
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.sync.chunk_size, 500);
        assert_eq!(config.sync.checksum_granularity, 16);
        assert!(config.sync.drop_policy.drop_extraneous);
        assert!(!config.sync.drop_policy.allow_recreate);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_backoff_ms, 200);
        assert!(config.sync.includes_database("shop"));
        assert!(!config.sync.includes_database("billing"));
        assert_eq!(
            config.storage_path(),
            PathBuf::from("/var/lib/wolfsync/documents.db")
        );
        config.validate_follower().unwrap();
    }

    #[test]
    fn test_rejects_bad_granularity() {
        let toml = r#"
[node]
id = "follower-1"

[sync]
checksum_granularity = 1
"#;
        assert!(matches!(
            WolfSyncConfig::from_str(toml),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn test_leader_address_required_for_sync() {
        let config = WolfSyncConfig::from_str("[node]\nid = \"n\"\n").unwrap();
        assert!(config.validate_follower().is_err());
    }
}
