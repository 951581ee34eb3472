//! Replication HTTP client, used by followers

use std::collections::BTreeMap;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::{Client, ClientBuilder, StatusCode};
use sha2::{Digest, Sha256};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use mirrorfs_core::types::{headers as wire, TransactionFrame};
use mirrorfs_core::{Error, ErrorBody, Result};

use crate::codec::FrameCodec;
use crate::protocol::StreamRequest;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    /// Applies to bounded requests only; the frame stream is long-lived
    /// and must not carry a total timeout
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

pub struct ReplicationClient {
    client: Client,
    config: ClientConfig,
}

impl ReplicationClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = ClientBuilder::new()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| Error::Transport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Open the ordered frame stream for `db`, starting after
    /// `position`. The returned stream yields decoded, checksum-verified
    /// frames until the primary drops the connection.
    pub async fn stream_frames(
        &self,
        base_url: &str,
        db: &str,
        position: u64,
    ) -> Result<impl Stream<Item = Result<TransactionFrame>> + Unpin> {
        let url = format!("{}/stream", base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .json(&StreamRequest {
                db: db.to_string(),
                position,
            })
            .send()
            .await
            .map_err(|e| Error::Transport(format!("stream connect failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        debug!(db, position, url = %url, "frame stream opened");

        let bytes = resp.bytes_stream().map_err(io::Error::other);
        let reader = StreamReader::new(bytes);
        let framed = FramedRead::new(reader, FrameCodec::new());
        Ok(Box::pin(framed.map(|item| {
            item.map_err(|e| Error::Transport(format!("frame stream failed: {e}")))
        })))
    }

    /// Fetch a full point-in-time copy. Verifies the SHA-256 the primary
    /// attached before handing the bytes back.
    pub async fn fetch_snapshot(&self, base_url: &str, db: &str) -> Result<(Bytes, u64)> {
        let url = format!("{}/snapshot/{}", base_url.trim_end_matches('/'), db);
        let mut attempt = 0;
        let mut delay = self.config.retry_base_delay;
        loop {
            attempt += 1;
            match self.try_fetch_snapshot(&url).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt <= self.config.max_retries => {
                    warn!(db, attempt, error = %e, "snapshot fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_fetch_snapshot(&self, url: &str) -> Result<(Bytes, u64)> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("snapshot fetch failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let position = header_value(&resp, wire::X_MIRRORFS_POSITION)?
            .parse::<u64>()
            .map_err(|e| Error::Transport(format!("bad snapshot position header: {e}")))?;
        let expected = header_value(&resp, wire::X_MIRRORFS_CHECKSUM)?;

        let data = resp
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("snapshot body read failed: {e}")))?;

        let got = hex::encode(Sha256::digest(&data));
        if got != expected {
            return Err(Error::ChecksumMismatch { expected, got });
        }
        Ok((data, position))
    }

    /// Database set and last positions on the primary
    pub async fn positions(&self, base_url: &str) -> Result<BTreeMap<String, u64>> {
        let url = format!("{}/pos", base_url.trim_end_matches('/'));
        let mut attempt = 0;
        let mut delay = self.config.retry_base_delay;
        loop {
            attempt += 1;
            let result = self
                .client
                .get(&url)
                .timeout(self.config.request_timeout)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json()
                        .await
                        .map_err(|e| Error::Transport(format!("malformed positions: {e}")));
                }
                Ok(resp) => return Err(error_from_response(resp).await),
                Err(e) => {
                    if attempt > self.config.max_retries {
                        return Err(Error::Transport(format!("positions fetch failed: {e}")));
                    }
                    debug!(attempt, error = %e, "positions fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}

fn header_value(resp: &reqwest::Response, name: &str) -> Result<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .ok_or_else(|| Error::Transport(format!("missing {name} header")))
}

/// Turn an error response back into the domain error the primary raised
async fn error_from_response(resp: reqwest::Response) -> Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    match ErrorBody::from_json(&body) {
        Some(parsed) => parsed.into_error(),
        None if status == StatusCode::SERVICE_UNAVAILABLE => Error::NotPrimary,
        None => Error::Transport(format!("status {status}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.max_retries, 3);
    }
}
