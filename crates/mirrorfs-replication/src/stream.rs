//! Primary-side frame streaming
//!
//! Each connected follower gets one feeder task. The feeder replays the
//! retained backlog from the frame log, then relays live commit events.
//! The per-follower buffer is bounded: when a follower cannot keep up
//! and the live tap lags, the connection is dropped and the follower
//! reconnects from its last applied position. A slow follower never
//! blocks a commit.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use futures::stream;
use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use mirrorfs_core::types::Role;
use mirrorfs_store::{Database, Store, StoreEvent};

use crate::metrics::MetricsRecorder;

/// How long a frame may sit in front of a stalled follower socket
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period for a frame that is durable but not yet visible in the
/// log directory listing
const LOG_RETRY_DELAY: Duration = Duration::from_millis(5);
const LOG_RETRY_LIMIT: u32 = 20;

/// One live follower stream, as shown in `/status`
#[derive(Debug, Clone)]
pub struct ReplicaConnection {
    pub id: u64,
    pub db: String,
    /// Highest position handed to this follower's buffer
    pub sent_position: u64,
}

/// Registry of live follower connections
#[derive(Debug, Default)]
pub struct ReplicaRegistry {
    connections: RwLock<HashMap<u64, ReplicaConnection>>,
    next_id: AtomicU64,
}

impl ReplicaRegistry {
    fn register(&self, db: &str, position: u64) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.connections.write().insert(
            id,
            ReplicaConnection {
                id,
                db: db.to_string(),
                sent_position: position,
            },
        );
        id
    }

    fn update(&self, id: u64, position: u64) {
        if let Some(conn) = self.connections.write().get_mut(&id) {
            conn.sent_position = position;
        }
    }

    fn remove(&self, id: u64) {
        self.connections.write().remove(&id);
    }

    pub fn connections(&self) -> Vec<ReplicaConnection> {
        self.connections.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

/// Build the streaming response body for one follower, spawning its
/// feeder task.
pub(crate) fn frame_body(
    store: Arc<Store>,
    db: Arc<Database>,
    registry: Arc<ReplicaRegistry>,
    from_position: u64,
    queue_depth: usize,
    metrics: Arc<MetricsRecorder>,
) -> Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(queue_depth);
    let conn_id = registry.register(db.name(), from_position);
    metrics.set_connected_followers(registry.len() as u64);
    debug!(db = db.name(), conn = conn_id, from = from_position, "follower stream opened");

    tokio::spawn(async move {
        let result = feed_frames(&store, &db, &registry, conn_id, from_position, &tx, &metrics).await;
        registry.remove(conn_id);
        metrics.set_connected_followers(registry.len() as u64);
        match result {
            Ok(()) => debug!(db = db.name(), conn = conn_id, "follower stream closed"),
            Err(reason) => {
                warn!(db = db.name(), conn = conn_id, reason, "follower stream dropped");
                metrics.record_stream_dropped(db.name(), reason);
            }
        }
    });

    // adapt the bounded queue into a response body
    let body_stream = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    Body::from_stream(body_stream)
}

enum SendOutcome {
    Sent,
    Disconnected,
    TimedOut,
}

async fn send_frame(tx: &mpsc::Sender<Result<Bytes, io::Error>>, bytes: Bytes) -> SendOutcome {
    match tokio::time::timeout(SEND_TIMEOUT, tx.send(Ok(bytes))).await {
        Ok(Ok(())) => SendOutcome::Sent,
        Ok(Err(_)) => SendOutcome::Disconnected,
        Err(_) => SendOutcome::TimedOut,
    }
}

/// Runs one follower stream until it disconnects (Ok) or must be
/// dropped (Err with the reason).
async fn feed_frames(
    store: &Store,
    db: &Database,
    registry: &ReplicaRegistry,
    conn_id: u64,
    from_position: u64,
    tx: &mpsc::Sender<Result<Bytes, io::Error>>,
    metrics: &MetricsRecorder,
) -> Result<(), &'static str> {
    // subscribe before reading the backlog so no commit falls between
    // the log tail and the live tap
    let mut events = store.subscribe();
    let mut next = from_position + 1;

    // backlog: everything already in the log
    let mut retries = 0u32;
    loop {
        match db.frame_bytes(next).await {
            Ok(Some(bytes)) => {
                retries = 0;
                match send_frame(tx, bytes).await {
                    SendOutcome::Sent => {
                        registry.update(conn_id, next);
                        metrics.record_frames_sent(db.name(), 1);
                        next += 1;
                    }
                    SendOutcome::Disconnected => return Ok(()),
                    SendOutcome::TimedOut => return Err("send timeout"),
                }
            }
            Ok(None) => {
                if next > db.position().await {
                    break; // caught up with the log
                }
                if next < db.retained_floor().await {
                    return Err("position trimmed during stream");
                }
                // durable but not yet visible; retry briefly
                retries += 1;
                if retries > LOG_RETRY_LIMIT {
                    return Err("frame missing from log");
                }
                tokio::time::sleep(LOG_RETRY_DELAY).await;
            }
            Err(e) => {
                warn!(db = db.name(), position = next, error = %e, "frame log read failed");
                return Err("log read failed");
            }
        }
    }

    // live: relay commit events in order
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                debug!(db = db.name(), conn = conn_id, skipped, "live tap lagged");
                return Err("buffer overflow");
            }
            Err(RecvError::Closed) => return Ok(()),
        };

        let frame = match event {
            StoreEvent::Commit { db: name, frame } if name == db.name() => frame,
            StoreEvent::RoleChanged { role: Role::Follower, .. } => {
                return Err("no longer primary");
            }
            _ => continue,
        };

        if frame.position < next {
            continue; // already served from the backlog
        }
        if frame.position > next {
            // commits landed while switching from backlog to live;
            // refill the gap from the log
            while next < frame.position {
                match db.frame_bytes(next).await {
                    Ok(Some(bytes)) => match send_frame(tx, bytes).await {
                        SendOutcome::Sent => {
                            registry.update(conn_id, next);
                            metrics.record_frames_sent(db.name(), 1);
                            next += 1;
                        }
                        SendOutcome::Disconnected => return Ok(()),
                        SendOutcome::TimedOut => return Err("send timeout"),
                    },
                    Ok(None) => return Err("gap while refilling from log"),
                    Err(_) => return Err("log read failed"),
                }
            }
        }

        match send_frame(tx, frame.encode()).await {
            SendOutcome::Sent => {
                registry.update(conn_id, frame.position);
                metrics.record_frames_sent(db.name(), 1);
                next = frame.position + 1;
            }
            SendOutcome::Disconnected => return Ok(()),
            SendOutcome::TimedOut => return Err("send timeout"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lifecycle() {
        let registry = ReplicaRegistry::default();
        assert!(registry.is_empty());

        let a = registry.register("app.db", 0);
        let b = registry.register("app.db", 5);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        registry.update(a, 9);
        let conns = registry.connections();
        let conn_a = conns.iter().find(|c| c.id == a).unwrap();
        assert_eq!(conn_a.sent_position, 9);

        registry.remove(a);
        registry.remove(b);
        assert!(registry.is_empty());
    }
}
