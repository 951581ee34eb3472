//! Common types used across the system

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Node role in the leadership state machine.
///
/// Every node starts as a follower. Only the lease holder is primary,
/// and only the primary accepts write transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Follower,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Follower => "follower",
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, Role::Primary)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A byte range within a database file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub offset: u64,
    pub len: u64,
}

impl PageRange {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    /// First byte past the range
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.len)
    }

    pub fn overlaps(&self, other: &PageRange) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}

/// Which backend arbitrates the primary lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseBackend {
    /// External HTTP lock service
    Http,
    /// This node is always the primary (single-node deployments)
    Static,
}

/// Runtime settings for the transaction store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding per-database state
    pub data_dir: PathBuf,
    /// How long `begin` waits behind an open transaction before `Busy`
    pub busy_timeout: Duration,
    /// Minimum number of recent frames kept in the log
    pub retention_min_frames: u64,
    /// How often retention is enforced
    pub retention_interval: Duration,
    /// Capacity of the store event channel
    pub event_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/mirrorfs"),
            busy_timeout: Duration::from_secs(1),
            retention_min_frames: 1024,
            retention_interval: Duration::from_secs(60),
            event_capacity: 1024,
        }
    }
}

/// Runtime settings for the lease manager
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub backend: LeaseBackend,
    /// Lock service base URL, required for the http backend
    pub url: String,
    /// Stable identity this node competes with
    pub candidate_id: String,
    /// Replication URL advertised to followers when primary
    pub advertise_url: String,
    /// Lease time-to-live; renewal runs at a third of this
    pub ttl: Duration,
    /// Whether this node may become primary at all
    pub candidate: bool,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            backend: LeaseBackend::Static,
            url: String::new(),
            candidate_id: String::new(),
            advertise_url: String::new(),
            ttl: Duration::from_secs(10),
            candidate: true,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(10),
        }
    }
}

/// Runtime settings for the replication server and follower loops
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub bind_address: String,
    pub port: u16,
    /// Frames buffered per follower connection before it is dropped
    pub send_queue_depth: usize,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// How often a follower polls the primary's database set
    pub positions_poll_interval: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 20202,
            send_queue_depth: 64,
            reconnect_base_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            positions_poll_interval: Duration::from_secs(2),
        }
    }
}

/// Wire headers used by the replication API
pub mod headers {
    /// Position a snapshot or stream was taken at
    pub const X_MIRRORFS_POSITION: &str = "x-mirrorfs-position";
    /// SHA-256 of a snapshot body, hex encoded
    pub const X_MIRRORFS_CHECKSUM: &str = "x-mirrorfs-checksum";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Primary.to_string(), "primary");
        assert_eq!(Role::Follower.to_string(), "follower");
        assert!(Role::Primary.is_primary());
        assert!(!Role::Follower.is_primary());
    }

    #[test]
    fn test_page_range_overlap() {
        let a = PageRange::new(0, 4096);
        let b = PageRange::new(4096, 4096);
        let c = PageRange::new(4000, 200);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&b));
        assert_eq!(a.end(), 4096);
    }

    #[test]
    fn test_lease_backend_serde() {
        let http: LeaseBackend = serde_json::from_str("\"http\"").unwrap();
        assert_eq!(http, LeaseBackend::Http);
        let s: LeaseBackend = serde_json::from_str("\"static\"").unwrap();
        assert_eq!(s, LeaseBackend::Static);
    }
}
