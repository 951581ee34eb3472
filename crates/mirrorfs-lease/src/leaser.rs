//! Lease provider interface

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mirrorfs_core::Result;

/// Smallest interval the renewal loop will run at
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(100);

/// A granted, time-bounded right to act as primary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    /// Backend-assigned lease id
    pub id: String,
    /// Candidate that holds the lease
    pub owner: String,
    /// Replication URL the holder advertises to followers
    pub advertise_url: String,
    pub ttl: Duration,
    /// When the lease was granted or last renewed
    pub renewed_at: DateTime<Utc>,
}

impl Lease {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.renewed_at
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero())
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at()
    }

    /// Renewal runs at a third of the TTL so two renew attempts can fail
    /// transiently before the lease actually lapses
    pub fn renew_interval(&self) -> Duration {
        (self.ttl / 3).max(MIN_RENEW_INTERVAL)
    }
}

/// Who currently holds the lease, as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryInfo {
    pub owner: String,
    pub advertise_url: String,
}

/// Backend-agnostic distributed lock.
///
/// `acquire` returns `Error::Busy` while another candidate holds the
/// lease. `renew` must fail rather than block when the backend cannot
/// confirm the lease is still held; the caller treats every renewal
/// failure as loss of leadership.
#[async_trait]
pub trait Leaser: Send + Sync {
    async fn acquire(&self, candidate: &str, advertise_url: &str, ttl: Duration) -> Result<Lease>;

    async fn renew(&self, lease: &Lease) -> Result<Lease>;

    async fn release(&self, lease: &Lease) -> Result<()>;

    /// Current holder, if the backend can report one
    async fn primary_info(&self) -> Result<Option<PrimaryInfo>>;
}
