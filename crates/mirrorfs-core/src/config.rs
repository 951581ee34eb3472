//! Configuration for mirrorfs

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{LeaseBackend, LeaseConfig, ReplicationConfig, StoreConfig};

/// Main configuration structure for mirrorfs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorfsConfig {
    pub node: NodeSection,
    pub store: StoreSection,
    pub lease: LeaseSection,
    pub replication: ReplicationSection,
    pub logging: LoggingSection,
}

impl Default for MirrorfsConfig {
    fn default() -> Self {
        Self {
            node: NodeSection::default(),
            store: StoreSection::default(),
            lease: LeaseSection::default(),
            replication: ReplicationSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

/// Identity of this node in the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Stable node id; generated when empty
    pub id: Option<String>,
    /// Human-readable name; defaults to the hostname
    pub name: Option<String>,
    /// URL followers use to reach this node; derived from the bind
    /// address when unset
    pub advertise_url: Option<String>,
    /// Whether this node may become primary
    pub candidate: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            advertise_url: None,
            candidate: true,
        }
    }
}

/// Transaction store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub data_dir: PathBuf,
    /// Milliseconds a writer waits behind an open transaction
    pub busy_timeout_ms: u64,
    /// Minimum number of recent frames kept per database
    pub retention_min_frames: u64,
    pub retention_interval_secs: u64,
    pub event_capacity: usize,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/mirrorfs"),
            busy_timeout_ms: 1000,
            retention_min_frames: 1024,
            retention_interval_secs: 60,
            event_capacity: 1024,
        }
    }
}

/// Lease backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseSection {
    pub backend: LeaseBackend,
    /// Lock service base URL, required for the http backend
    pub url: String,
    pub ttl_secs: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for LeaseSection {
    fn default() -> Self {
        Self {
            backend: LeaseBackend::Static,
            url: String::new(),
            ttl_secs: 10,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 10_000,
        }
    }
}

/// Replication endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationSection {
    pub bind_address: String,
    pub port: u16,
    /// Frames buffered per follower connection before it is dropped
    pub send_queue_depth: usize,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub positions_poll_interval_ms: u64,
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 20202,
            send_queue_depth: 64,
            reconnect_base_delay_ms: 100,
            reconnect_max_delay_ms: 5000,
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            positions_poll_interval_ms: 2000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json or pretty)
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl MirrorfsConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Internal(format!("failed to read config file {path}: {e}")))?;
        toml::from_str(&content)
            .map_err(|e| Error::Internal(format!("failed to parse config file {path}: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("MIRRORFS_NODE_ID") {
            config.node.id = Some(id);
        }
        if let Ok(name) = std::env::var("MIRRORFS_NODE_NAME") {
            config.node.name = Some(name);
        }
        if let Ok(url) = std::env::var("MIRRORFS_ADVERTISE_URL") {
            config.node.advertise_url = Some(url);
        }
        if let Ok(candidate) = std::env::var("MIRRORFS_CANDIDATE") {
            config.node.candidate = candidate == "true" || candidate == "1";
        }
        if let Ok(dir) = std::env::var("MIRRORFS_DATA_DIR") {
            config.store.data_dir = PathBuf::from(dir);
        }
        if let Ok(backend) = std::env::var("MIRRORFS_LEASE_BACKEND") {
            match backend.as_str() {
                "http" => config.lease.backend = LeaseBackend::Http,
                "static" => config.lease.backend = LeaseBackend::Static,
                _ => {}
            }
        }
        if let Ok(url) = std::env::var("MIRRORFS_LEASE_URL") {
            config.lease.url = url;
        }
        if let Ok(ttl) = std::env::var("MIRRORFS_LEASE_TTL_SECS") {
            if let Ok(secs) = ttl.parse() {
                config.lease.ttl_secs = secs;
            }
        }
        if let Ok(addr) = std::env::var("MIRRORFS_BIND_ADDRESS") {
            config.replication.bind_address = addr;
        }
        if let Ok(port) = std::env::var("MIRRORFS_PORT") {
            if let Ok(port) = port.parse() {
                config.replication.port = port;
            }
        }
        if let Ok(level) = std::env::var("MIRRORFS_LOG_LEVEL") {
            config.logging.level = level;
        }

        config
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.store.data_dir.as_os_str().is_empty() {
            return Err(Error::InvalidArgument(
                "store.data_dir must not be empty".to_string(),
            ));
        }
        if self.store.busy_timeout_ms == 0 {
            return Err(Error::InvalidArgument(
                "store.busy_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.lease.backend == LeaseBackend::Http && self.lease.url.is_empty() {
            return Err(Error::InvalidArgument(
                "lease.url is required for the http backend".to_string(),
            ));
        }
        if self.lease.ttl_secs == 0 {
            return Err(Error::InvalidArgument(
                "lease.ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.replication.send_queue_depth == 0 {
            return Err(Error::InvalidArgument(
                "replication.send_queue_depth must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Stable node id, generating one when unset
    pub fn node_id(&self) -> String {
        self.node
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    /// Node name, falling back to the hostname
    pub fn node_name(&self) -> String {
        self.node.name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "mirrorfs-node".to_string())
        })
    }

    /// URL advertised to followers
    pub fn advertise_url(&self) -> String {
        self.node.advertise_url.clone().unwrap_or_else(|| {
            let host = if self.replication.bind_address == "0.0.0.0" {
                self.node_name()
            } else {
                self.replication.bind_address.clone()
            };
            format!("http://{}:{}", host, self.replication.port)
        })
    }

    /// Project the store settings into their runtime form
    pub fn to_store_config(&self) -> StoreConfig {
        StoreConfig {
            data_dir: self.store.data_dir.clone(),
            busy_timeout: Duration::from_millis(self.store.busy_timeout_ms),
            retention_min_frames: self.store.retention_min_frames,
            retention_interval: Duration::from_secs(self.store.retention_interval_secs),
            event_capacity: self.store.event_capacity,
        }
    }

    /// Project the lease settings into their runtime form
    pub fn to_lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            backend: self.lease.backend,
            url: self.lease.url.clone(),
            candidate_id: self.node_id(),
            advertise_url: self.advertise_url(),
            ttl: Duration::from_secs(self.lease.ttl_secs),
            candidate: self.node.candidate,
            retry_base_delay: Duration::from_millis(self.lease.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.lease.retry_max_delay_ms),
        }
    }

    /// Project the replication settings into their runtime form
    pub fn to_replication_config(&self) -> ReplicationConfig {
        ReplicationConfig {
            bind_address: self.replication.bind_address.clone(),
            port: self.replication.port,
            send_queue_depth: self.replication.send_queue_depth,
            reconnect_base_delay: Duration::from_millis(self.replication.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.replication.reconnect_max_delay_ms),
            connect_timeout: Duration::from_secs(self.replication.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.replication.request_timeout_secs),
            positions_poll_interval: Duration::from_millis(
                self.replication.positions_poll_interval_ms,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MirrorfsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.replication.port, 20202);
        assert!(config.node.candidate);
    }

    #[test]
    fn test_http_backend_requires_url() {
        let mut config = MirrorfsConfig::default();
        config.lease.backend = LeaseBackend::Http;
        assert!(config.validate().is_err());
        config.lease.url = "http://lock.internal:8080".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
            [store]
            data_dir = "/tmp/mfs"

            [lease]
            backend = "http"
            url = "http://lock.internal:8080"
            ttl_secs = 5

            [replication]
            port = 20303
        "#;
        let config: MirrorfsConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.store.data_dir, PathBuf::from("/tmp/mfs"));
        assert_eq!(config.lease.backend, LeaseBackend::Http);
        assert_eq!(config.lease.ttl_secs, 5);
        assert_eq!(config.replication.port, 20303);
        // untouched sections keep their defaults
        assert_eq!(config.store.busy_timeout_ms, 1000);
        assert_eq!(config.replication.send_queue_depth, 64);
    }

    #[test]
    fn test_lease_config_projection() {
        let mut config = MirrorfsConfig::default();
        config.node.id = Some("node-a".to_string());
        config.node.advertise_url = Some("http://10.0.0.1:20202".to_string());
        config.lease.ttl_secs = 9;
        let lease = config.to_lease_config();
        assert_eq!(lease.candidate_id, "node-a");
        assert_eq!(lease.advertise_url, "http://10.0.0.1:20202");
        assert_eq!(lease.ttl, Duration::from_secs(9));
    }

    #[test]
    fn test_advertise_url_derived_from_bind() {
        let mut config = MirrorfsConfig::default();
        config.replication.bind_address = "10.0.0.7".to_string();
        config.replication.port = 20404;
        assert_eq!(config.advertise_url(), "http://10.0.0.7:20404");
    }
}
