//! HTTP lock service lease backend
//!
//! Talks to an external lock service that arbitrates one lease per
//! cluster:
//!
//! ```text
//! PUT    /v1/lease          acquire; 409 while held by someone else
//! PUT    /v1/lease/{id}     renew; 404 or 409 once the lease lapsed
//! DELETE /v1/lease/{id}     release
//! GET    /v1/primary        current holder; 404 when none
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use mirrorfs_core::{Error, Result};

use crate::leaser::{Lease, Leaser, PrimaryInfo};

#[derive(Debug, Clone)]
pub struct HttpLeaserConfig {
    /// Lock service base URL
    pub url: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Retries for acquire, release, and primary lookups. Renewal never
    /// retries: a renewal that cannot complete in time is a lost lease.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for HttpLeaserConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Serialize)]
struct AcquireRequest<'a> {
    candidate: &'a str,
    advertise_url: &'a str,
    ttl_secs: u64,
}

#[derive(Deserialize)]
struct GrantResponse {
    id: String,
    #[serde(default)]
    ttl_secs: Option<u64>,
}

pub struct HttpLeaser {
    client: Client,
    config: HttpLeaserConfig,
}

impl HttpLeaser {
    pub fn new(config: HttpLeaserConfig) -> Result<Self> {
        let client = ClientBuilder::new()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| Error::Lease(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl Leaser for HttpLeaser {
    async fn acquire(&self, candidate: &str, advertise_url: &str, ttl: Duration) -> Result<Lease> {
        let url = self.endpoint("/v1/lease");
        let body = AcquireRequest {
            candidate,
            advertise_url,
            ttl_secs: ttl.as_secs(),
        };

        let mut attempt = 0;
        let mut delay = self.config.retry_base_delay;
        loop {
            attempt += 1;
            match self.client.put(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let grant: GrantResponse = resp
                        .json()
                        .await
                        .map_err(|e| Error::Lease(format!("malformed grant: {e}")))?;
                    return Ok(Lease {
                        id: grant.id,
                        owner: candidate.to_string(),
                        advertise_url: advertise_url.to_string(),
                        ttl: grant.ttl_secs.map(Duration::from_secs).unwrap_or(ttl),
                        renewed_at: Utc::now(),
                    });
                }
                Ok(resp) if resp.status() == StatusCode::CONFLICT => return Err(Error::Busy),
                Ok(resp) => {
                    let status = resp.status();
                    if attempt > self.config.max_retries || status.is_client_error() {
                        return Err(Error::Lease(format!("acquire failed with status {status}")));
                    }
                    warn!(attempt, %status, "lease acquire returned error status, retrying");
                }
                Err(e) => {
                    if attempt > self.config.max_retries {
                        return Err(Error::Transport(format!("lease acquire failed: {e}")));
                    }
                    warn!(attempt, error = %e, "lease acquire failed, retrying");
                }
            }
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    /// Single attempt: failing fast here is what bounds how long a
    /// deposed primary can keep accepting writes.
    async fn renew(&self, lease: &Lease) -> Result<Lease> {
        let url = self.endpoint(&format!("/v1/lease/{}", lease.id));
        let resp = self
            .client
            .put(&url)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("lease renewal failed: {e}")))?;
        match resp.status() {
            status if status.is_success() => Ok(Lease {
                renewed_at: Utc::now(),
                ..lease.clone()
            }),
            StatusCode::NOT_FOUND | StatusCode::CONFLICT => {
                Err(Error::Lease("lease no longer held".to_string()))
            }
            status => Err(Error::Lease(format!("renewal failed with status {status}"))),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let url = self.endpoint(&format!("/v1/lease/{}", lease.id));
        let mut attempt = 0;
        let mut delay = self.config.retry_base_delay;
        loop {
            attempt += 1;
            match self.client.delete(&url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                // already gone is as good as released
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => return Ok(()),
                Ok(resp) => {
                    if attempt > self.config.max_retries {
                        return Err(Error::Lease(format!(
                            "release failed with status {}",
                            resp.status()
                        )));
                    }
                }
                Err(e) => {
                    if attempt > self.config.max_retries {
                        return Err(Error::Transport(format!("lease release failed: {e}")));
                    }
                    debug!(attempt, error = %e, "lease release failed, retrying");
                }
            }
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    async fn primary_info(&self) -> Result<Option<PrimaryInfo>> {
        let url = self.endpoint("/v1/primary");
        let mut attempt = 0;
        let mut delay = self.config.retry_base_delay;
        loop {
            attempt += 1;
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let info: PrimaryInfo = resp
                        .json()
                        .await
                        .map_err(|e| Error::Lease(format!("malformed primary info: {e}")))?;
                    return Ok(Some(info));
                }
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => return Ok(None),
                Ok(resp) => {
                    if attempt > self.config.max_retries {
                        return Err(Error::Lease(format!(
                            "primary lookup failed with status {}",
                            resp.status()
                        )));
                    }
                }
                Err(e) => {
                    if attempt > self.config.max_retries {
                        return Err(Error::Transport(format!("primary lookup failed: {e}")));
                    }
                }
            }
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
}
