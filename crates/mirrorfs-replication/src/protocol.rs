//! Wire contract of the replication API

use serde::{Deserialize, Serialize};

use mirrorfs_core::types::Role;

/// Body of `POST /stream`. Frames are served from `position + 1`; a
/// follower with an empty database asks for position 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRequest {
    pub db: String,
    /// Last position the follower holds
    pub position: u64,
}

/// Body of `GET /status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub role: Role,
    pub primary_url: Option<String>,
    pub databases: u64,
    /// Live follower stream connections served by this node
    pub followers: u64,
    pub version: String,
}
