//! Configuration types for pkgindex
//!
//! This module defines configuration structures used across components.
//! Every section falls back to its defaults when omitted, so a config file
//! only has to name what it changes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for pkgindex
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node identity and role
    pub node: NodeConfig,
    /// KeyFS storage configuration
    pub storage: StorageConfig,
    /// Mirror stage configuration
    pub mirror: MirrorConfig,
}

/// Node identity and role configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory holding the keyfs database
    pub data_dir: PathBuf,
    /// Whether this node writes (primary) or follows (replica)
    pub role: NodeRole,
    /// Identifier sent to the primary when running as replica
    pub replica_uuid: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/pkgindex"),
            role: NodeRole::Primary,
            replica_uuid: None,
        }
    }
}

/// Role of this node in a primary/replica deployment
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeRole {
    /// Single writer; talks to the upstream mirror directly
    #[default]
    Primary,
    /// Read-only follower; receives changes from `primary_url`
    Replica { primary_url: String },
}

impl NodeRole {
    /// True when this node only applies replicated changes
    #[must_use]
    pub fn is_replica(&self) -> bool {
        matches!(self, Self::Replica { .. })
    }
}

/// Storage backend selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Database file below `node.data_dir`
    #[default]
    File,
    /// Volatile in-memory database (tests, throwaway mirrors)
    Memory,
}

/// KeyFS storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend to open
    pub backend: BackendKind,
    /// File name of the database inside the data directory
    pub db_filename: String,
    /// Total number of read-cache entries (split between both pools)
    pub cache_size: usize,
    /// Maximum wait for exclusive write admission (seconds)
    pub write_admission_timeout_secs: u64,
    /// Estimated value size above which resolved values go to the
    /// changelog pool instead of the relpath pool (bytes)
    pub big_value_threshold: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::File,
            db_filename: ".redb_db".to_string(),
            cache_size: 10_000,
            write_admission_timeout_secs: 30,
            big_value_threshold: 100_000,
        }
    }
}

impl StorageConfig {
    /// Write admission timeout as a duration
    #[must_use]
    pub fn write_admission_timeout(&self) -> Duration {
        Duration::from_secs(self.write_admission_timeout_secs)
    }
}

/// Mirror stage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Owner of the mirror stage
    pub user: String,
    /// Index name of the mirror stage
    pub index: String,
    /// Upstream simple index URL
    pub mirror_url: String,
    /// Seconds cached links are served without asking upstream
    pub cache_expiry_secs: u64,
    /// Overall bound for one upstream refresh (seconds)
    pub request_timeout_secs: u64,
    /// Never contact upstream; serve whatever is cached
    pub offline: bool,
    /// Concurrent detached refreshes allowed to write
    pub max_background_refreshes: usize,
    /// User agent sent upstream
    pub user_agent: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            index: "pypi".to_string(),
            mirror_url: "https://pypi.org/simple/".to_string(),
            cache_expiry_secs: 1800,
            request_timeout_secs: 5,
            offline: false,
            max_background_refreshes: 8,
            user_agent: concat!("pkgindex/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl MirrorConfig {
    /// Cache expiry as a duration
    #[must_use]
    pub fn cache_expiry(&self) -> Duration {
        Duration::from_secs(self.cache_expiry_secs)
    }

    /// Request timeout as a duration
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.role, NodeRole::Primary);
        assert_eq!(config.storage.cache_size, 10_000);
        assert_eq!(config.storage.write_admission_timeout(), Duration::from_secs(30));
        assert_eq!(config.mirror.cache_expiry(), Duration::from_secs(1800));
        assert_eq!(config.mirror.request_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"mirror": {"offline": true}, "node": {"role": {"kind": "replica", "primary_url": "http://primary:3141"}}}"#,
        )
        .unwrap();
        assert!(config.mirror.offline);
        assert_eq!(config.mirror.index, "pypi");
        assert!(config.node.role.is_replica());
        assert_eq!(config.storage.backend, BackendKind::File);
    }
}
