//! Follower-side replication loops.
//!
//! A supervisor polls the primary's database set and keeps one
//! streaming loop per database alive. Each loop connects at the
//! local position, applies frames in order, and falls back to a full
//! snapshot when its position predates the primary's retained log.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use mirrorfs_core::types::ReplicationConfig;
use mirrorfs_core::{Error, Result};
use mirrorfs_store::Store;

use crate::client::{ClientConfig, ReplicationClient};
use crate::metrics::MetricsRecorder;

pub struct FollowerRunner {
    store: Arc<Store>,
    config: ReplicationConfig,
    client: Arc<ReplicationClient>,
    metrics: Arc<MetricsRecorder>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    shutdown: Arc<RwLock<bool>>,
}

impl FollowerRunner {
    pub fn new(store: Arc<Store>, config: ReplicationConfig) -> Result<Self> {
        let client = ReplicationClient::new(ClientConfig {
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            ..ClientConfig::default()
        })?;
        Ok(Self {
            store,
            config,
            client: Arc::new(client),
            metrics: Arc::new(MetricsRecorder::new()),
            tasks: Mutex::new(HashMap::new()),
            shutdown: Arc::new(RwLock::new(false)),
        })
    }

    /// Spawn the supervisor. It is a no-op while this node is primary
    /// or no primary is known, and starts per-database loops otherwise.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(runner.config.positions_poll_interval);
            loop {
                ticker.tick().await;
                if *runner.shutdown.read() {
                    break;
                }
                if runner.store.role().is_primary() {
                    runner.stop_tasks();
                    continue;
                }
                let Some(primary_url) = runner.store.primary_url() else {
                    continue;
                };
                let positions = match runner.client.positions(&primary_url).await {
                    Ok(positions) => positions,
                    Err(e) => {
                        debug!(primary = %primary_url, error = %e, "primary position poll failed");
                        continue;
                    }
                };
                for db_name in positions.keys() {
                    if let Err(e) = runner.store.create_database(db_name).await {
                        warn!(db = %db_name, error = %e, "could not create local database");
                    }
                }
                let mut tasks = runner.tasks.lock();
                tasks.retain(|_, handle| !handle.is_finished());
                for db_name in positions.keys() {
                    if tasks.contains_key(db_name) {
                        continue;
                    }
                    let handle = tokio::spawn(run_db_loop(
                        Arc::clone(&runner.store),
                        Arc::clone(&runner.client),
                        runner.config.clone(),
                        db_name.clone(),
                        Arc::clone(&runner.metrics),
                        Arc::clone(&runner.shutdown),
                    ));
                    tasks.insert(db_name.clone(), handle);
                }
            }
            runner.stop_tasks();
            debug!("follower supervisor stopped");
        })
    }

    pub fn stop(&self) {
        *self.shutdown.write() = true;
        self.stop_tasks();
        info!("follower runner stopped");
    }

    fn stop_tasks(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_empty() {
            return;
        }
        for (db_name, handle) in tasks.drain() {
            handle.abort();
            debug!(db = %db_name, "replication loop aborted");
        }
    }
}

impl std::fmt::Debug for FollowerRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FollowerRunner")
            .field("active_loops", &self.tasks.lock().len())
            .finish()
    }
}

/// Stream frames for one database until shutdown, promotion, or a
/// failure that warrants reconnecting.
async fn run_db_loop(
    store: Arc<Store>,
    client: Arc<ReplicationClient>,
    config: ReplicationConfig,
    db_name: String,
    metrics: Arc<MetricsRecorder>,
    shutdown: Arc<RwLock<bool>>,
) {
    let mut delay = config.reconnect_base_delay;
    'outer: loop {
        if *shutdown.read() || store.role().is_primary() {
            break;
        }
        let Some(primary_url) = store.primary_url() else {
            break;
        };
        let db = match store.database(&db_name) {
            Ok(db) => db,
            Err(e) => {
                warn!(db = %db_name, error = %e, "database vanished from store");
                break;
            }
        };

        let position = db.position().await;
        match client.stream_frames(&primary_url, &db_name, position).await {
            Ok(mut frames) => {
                info!(db = %db_name, position, primary = %primary_url, "streaming from primary");
                delay = config.reconnect_base_delay;
                while let Some(item) = frames.next().await {
                    if *shutdown.read() || store.role().is_primary() {
                        break 'outer;
                    }
                    let frame = match item {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!(db = %db_name, error = %e, "frame stream ended");
                            break;
                        }
                    };
                    let apply_position = frame.position;
                    match db.apply_frame(frame).await {
                        Ok(()) => {}
                        Err(
                            e @ (Error::PositionGap { .. }
                            | Error::ChecksumMismatch { .. }
                            | Error::InvalidationFailed(_)
                            | Error::OutOfSync(_)),
                        ) => {
                            warn!(
                                db = %db_name,
                                position = apply_position,
                                error = %e,
                                "apply failed, falling back to snapshot"
                            );
                            if let Err(e) =
                                resync(&store, &client, &primary_url, &db_name, &metrics).await
                            {
                                warn!(db = %db_name, error = %e, "snapshot resync failed");
                            }
                            break;
                        }
                        Err(e) => {
                            warn!(db = %db_name, position = apply_position, error = %e, "frame apply failed");
                            break;
                        }
                    }
                }
            }
            Err(Error::SnapshotRequired { min_position }) => {
                info!(
                    db = %db_name,
                    position,
                    min_position,
                    "position predates retained log, fetching snapshot"
                );
                if let Err(e) = resync(&store, &client, &primary_url, &db_name, &metrics).await {
                    warn!(db = %db_name, error = %e, "snapshot resync failed");
                }
            }
            Err(e) => {
                debug!(db = %db_name, primary = %primary_url, error = %e, "stream connect failed");
            }
        }

        metrics.record_reconnect(&db_name);
        tokio::time::sleep(with_jitter(delay)).await;
        delay = (delay * 2).min(config.reconnect_max_delay);
    }
    debug!(db = %db_name, "replication loop stopped");
}

/// Replace the local copy with a verified snapshot from the primary
async fn resync(
    store: &Store,
    client: &ReplicationClient,
    primary_url: &str,
    db_name: &str,
    metrics: &MetricsRecorder,
) -> Result<()> {
    let db = store.database(db_name)?;
    let (data, position) = client.fetch_snapshot(primary_url, db_name).await?;
    let size = data.len();
    db.install_snapshot(&data, position).await?;
    metrics.record_snapshot_installed(db_name);
    info!(db = db_name, position, size, "snapshot installed");
    Ok(())
}

/// Spread reconnecting followers out so they do not stampede the primary
fn with_jitter(delay: Duration) -> Duration {
    let cap = delay.as_millis().min(250) as u64;
    if cap == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=cap))
}
