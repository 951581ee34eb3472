//! Lease acquisition and renewal loop

use std::sync::Arc;
use std::time::Duration;

use metrics::gauge;
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mirrorfs_core::types::LeaseConfig;
use mirrorfs_core::Error;

use crate::leaser::{Lease, Leaser, PrimaryInfo};

const EVENT_QUEUE_DEPTH: usize = 64;

/// Leadership changes, in the order they must be applied to the store
#[derive(Debug, Clone)]
pub enum LeaseEvent {
    /// This node holds the lease and may accept writes
    Acquired { lease: Lease },
    /// Leadership lost or surrendered; writes must stop immediately
    Lost,
    /// Another node's advertised address became known or changed
    PrimaryChanged { primary: Option<PrimaryInfo> },
}

/// Runs the acquire/renew loop and reports leadership changes over a
/// channel. Candidates compete for the lease with backoff; non-candidate
/// nodes only track who the primary is.
pub struct LeaseManager {
    config: LeaseConfig,
    leaser: Arc<dyn Leaser>,
    events: mpsc::Sender<LeaseEvent>,
    shutdown: Arc<RwLock<bool>>,
    wake: Arc<Notify>,
}

impl LeaseManager {
    pub fn new(
        config: LeaseConfig,
        leaser: Arc<dyn Leaser>,
    ) -> (Self, mpsc::Receiver<LeaseEvent>) {
        let (events, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        (
            Self {
                config,
                leaser,
                events,
                shutdown: Arc::new(RwLock::new(false)),
                wake: Arc::new(Notify::new()),
            },
            rx,
        )
    }

    /// Spawn the lease loop. The handle resolves after `stop`, once any
    /// held lease has been released.
    pub fn start(&self) -> JoinHandle<()> {
        let config = self.config.clone();
        let leaser = Arc::clone(&self.leaser);
        let events = self.events.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let wake = Arc::clone(&self.wake);
        tokio::spawn(async move {
            run_loop(config, leaser, events, shutdown, wake).await;
        })
    }

    /// Request shutdown. The loop releases a held lease so another
    /// candidate can take over without waiting out the TTL.
    pub fn stop(&self) {
        *self.shutdown.write() = true;
        self.wake.notify_waiters();
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("candidate_id", &self.config.candidate_id)
            .field("candidate", &self.config.candidate)
            .finish()
    }
}

async fn run_loop(
    config: LeaseConfig,
    leaser: Arc<dyn Leaser>,
    events: mpsc::Sender<LeaseEvent>,
    shutdown: Arc<RwLock<bool>>,
    wake: Arc<Notify>,
) {
    let mut held: Option<Lease> = None;
    let mut known_primary: Option<PrimaryInfo> = None;
    let mut backoff = config.retry_base_delay;

    loop {
        if *shutdown.read() {
            if let Some(lease) = held.take() {
                match leaser.release(&lease).await {
                    Ok(()) => info!("released lease on shutdown"),
                    Err(e) => warn!(error = %e, "failed to release lease on shutdown"),
                }
                gauge!("mirrorfs_lease_held").set(0.0);
                let _ = events.send(LeaseEvent::Lost).await;
            }
            break;
        }

        match &held {
            Some(lease) => {
                sleep_or_wake(lease.renew_interval(), &wake).await;
                if *shutdown.read() {
                    continue;
                }
                match leaser.renew(lease).await {
                    Ok(renewed) => {
                        debug!(lease = %renewed.id, "lease renewed");
                        held = Some(renewed);
                    }
                    Err(e) => {
                        // any renewal failure means leadership is gone,
                        // before the next write can be accepted
                        warn!(error = %e, "lease renewal failed, demoting");
                        held = None;
                        known_primary = None;
                        backoff = config.retry_base_delay;
                        gauge!("mirrorfs_lease_held").set(0.0);
                        let _ = events.send(LeaseEvent::Lost).await;
                    }
                }
            }
            None => {
                if config.candidate {
                    match leaser
                        .acquire(&config.candidate_id, &config.advertise_url, config.ttl)
                        .await
                    {
                        Ok(lease) => {
                            info!(lease = %lease.id, "lease acquired, promoting");
                            backoff = config.retry_base_delay;
                            gauge!("mirrorfs_lease_held").set(1.0);
                            let _ = events
                                .send(LeaseEvent::Acquired {
                                    lease: lease.clone(),
                                })
                                .await;
                            held = Some(lease);
                            continue;
                        }
                        Err(Error::Busy) => {
                            // someone else is primary; learn who
                            let primary = leaser.primary_info().await.unwrap_or(None);
                            if primary != known_primary {
                                known_primary = primary.clone();
                                let _ =
                                    events.send(LeaseEvent::PrimaryChanged { primary }).await;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "lease acquisition failed");
                        }
                    }
                } else {
                    match leaser.primary_info().await {
                        Ok(primary) => {
                            if primary != known_primary {
                                known_primary = primary.clone();
                                let _ =
                                    events.send(LeaseEvent::PrimaryChanged { primary }).await;
                            }
                        }
                        Err(e) => debug!(error = %e, "primary lookup failed"),
                    }
                }
                sleep_or_wake(with_jitter(backoff), &wake).await;
                backoff = (backoff * 2).min(config.retry_max_delay);
            }
        }
    }
    debug!("lease loop stopped");
}

/// Spread candidates out so they do not hammer the backend in lockstep
fn with_jitter(delay: Duration) -> Duration {
    let cap = delay.as_millis().min(250) as u64;
    if cap == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=cap))
}

async fn sleep_or_wake(delay: Duration, wake: &Notify) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = wake.notified() => {}
    }
}
