//! In-process lease backends
//!
//! [`StaticLeaser`] pins leadership to one configured node and never
//! expires; it backs single-node deployments. [`MemoryLeaser`] is a real
//! single-process lock with TTL expiry, shared between nodes in tests
//! and embedded setups.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use mirrorfs_core::{Error, Result};

use crate::leaser::{Lease, Leaser, PrimaryInfo};

/// Always grants the lease to the configured node
#[derive(Debug, Clone)]
pub struct StaticLeaser {
    owner: String,
    advertise_url: String,
}

impl StaticLeaser {
    pub fn new(owner: impl Into<String>, advertise_url: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            advertise_url: advertise_url.into(),
        }
    }
}

#[async_trait]
impl Leaser for StaticLeaser {
    async fn acquire(&self, candidate: &str, advertise_url: &str, ttl: Duration) -> Result<Lease> {
        if candidate != self.owner {
            return Err(Error::Busy);
        }
        Ok(Lease {
            id: "static".to_string(),
            owner: candidate.to_string(),
            advertise_url: advertise_url.to_string(),
            ttl,
            renewed_at: Utc::now(),
        })
    }

    async fn renew(&self, lease: &Lease) -> Result<Lease> {
        Ok(Lease {
            renewed_at: Utc::now(),
            ..lease.clone()
        })
    }

    async fn release(&self, _lease: &Lease) -> Result<()> {
        Ok(())
    }

    async fn primary_info(&self) -> Result<Option<PrimaryInfo>> {
        Ok(Some(PrimaryInfo {
            owner: self.owner.clone(),
            advertise_url: self.advertise_url.clone(),
        }))
    }
}

struct HeldLease {
    lease: Lease,
    expires_at: DateTime<Utc>,
}

/// Single-process lock with TTL semantics
#[derive(Default)]
pub struct MemoryLeaser {
    state: Mutex<Option<HeldLease>>,
}

impl MemoryLeaser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force the current lease to lapse immediately
    pub fn expire_now(&self) {
        if let Some(held) = self.state.lock().as_mut() {
            held.expires_at = Utc::now();
        }
    }

    /// Owner of the live lease, if any
    pub fn holder(&self) -> Option<String> {
        let state = self.state.lock();
        state
            .as_ref()
            .filter(|h| h.expires_at > Utc::now())
            .map(|h| h.lease.owner.clone())
    }
}

#[async_trait]
impl Leaser for MemoryLeaser {
    async fn acquire(&self, candidate: &str, advertise_url: &str, ttl: Duration) -> Result<Lease> {
        let mut state = self.state.lock();
        if let Some(held) = state.as_ref() {
            if held.expires_at > Utc::now() && held.lease.owner != candidate {
                return Err(Error::Busy);
            }
        }
        let lease = Lease {
            id: uuid::Uuid::new_v4().to_string(),
            owner: candidate.to_string(),
            advertise_url: advertise_url.to_string(),
            ttl,
            renewed_at: Utc::now(),
        };
        *state = Some(HeldLease {
            lease: lease.clone(),
            expires_at: lease.expires_at(),
        });
        Ok(lease)
    }

    async fn renew(&self, lease: &Lease) -> Result<Lease> {
        let mut state = self.state.lock();
        match state.as_mut() {
            Some(held) if held.lease.id == lease.id && held.expires_at > Utc::now() => {
                let renewed = Lease {
                    renewed_at: Utc::now(),
                    ..lease.clone()
                };
                held.lease = renewed.clone();
                held.expires_at = renewed.expires_at();
                Ok(renewed)
            }
            _ => Err(Error::Lease("lease no longer held".to_string())),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let mut state = self.state.lock();
        if state
            .as_ref()
            .map(|h| h.lease.id == lease.id)
            .unwrap_or(false)
        {
            *state = None;
        }
        Ok(())
    }

    async fn primary_info(&self) -> Result<Option<PrimaryInfo>> {
        let state = self.state.lock();
        Ok(state
            .as_ref()
            .filter(|h| h.expires_at > Utc::now())
            .map(|h| PrimaryInfo {
                owner: h.lease.owner.clone(),
                advertise_url: h.lease.advertise_url.clone(),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let leaser = MemoryLeaser::new();
        let lease = leaser.acquire("node-a", "http://a:1", TTL).await.unwrap();
        assert!(matches!(
            leaser.acquire("node-b", "http://b:1", TTL).await,
            Err(Error::Busy)
        ));
        assert_eq!(leaser.holder().as_deref(), Some("node-a"));

        leaser.release(&lease).await.unwrap();
        assert!(leaser.acquire("node-b", "http://b:1", TTL).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let leaser = MemoryLeaser::new();
        let stale = leaser.acquire("node-a", "http://a:1", TTL).await.unwrap();
        leaser.expire_now();

        let lease = leaser.acquire("node-b", "http://b:1", TTL).await.unwrap();
        assert_eq!(lease.owner, "node-b");

        // the old holder can no longer renew
        assert!(leaser.renew(&stale).await.is_err());
    }

    #[tokio::test]
    async fn test_renew_extends_lease() {
        let leaser = MemoryLeaser::new();
        let lease = leaser.acquire("node-a", "http://a:1", TTL).await.unwrap();
        let renewed = leaser.renew(&lease).await.unwrap();
        assert_eq!(renewed.id, lease.id);
        assert!(renewed.renewed_at >= lease.renewed_at);
    }

    #[tokio::test]
    async fn test_primary_info_reflects_holder() {
        let leaser = MemoryLeaser::new();
        assert_eq!(leaser.primary_info().await.unwrap(), None);
        leaser.acquire("node-a", "http://a:1", TTL).await.unwrap();
        let info = leaser.primary_info().await.unwrap().unwrap();
        assert_eq!(info.owner, "node-a");
        assert_eq!(info.advertise_url, "http://a:1");
        leaser.expire_now();
        assert_eq!(leaser.primary_info().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_static_leaser_grants_only_configured_owner() {
        let leaser = StaticLeaser::new("node-a", "http://a:1");
        let lease = leaser.acquire("node-a", "http://a:1", TTL).await.unwrap();
        assert!(leaser.renew(&lease).await.is_ok());
        assert!(matches!(
            leaser.acquire("node-b", "http://b:1", TTL).await,
            Err(Error::Busy)
        ));
        let info = leaser.primary_info().await.unwrap().unwrap();
        assert_eq!(info.owner, "node-a");
    }
}
