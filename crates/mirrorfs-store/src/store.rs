//! Process-wide store
//!
//! Tracks every replicated database under one data directory, carries
//! the node's role as reported by the lease manager, and fans commit
//! events out to replication streams.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use metrics::gauge;
use parking_lot::RwLock;
use tokio::fs;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

use mirrorfs_core::types::{Role, StoreConfig};
use mirrorfs_core::{Error, NoopInvalidator, PageCacheInvalidator, Result, MAX_DB_NAME_LENGTH};

use crate::db::{Database, SharedInvalidator};
use crate::events::StoreEvent;

/// Cluster role as last reported by the lease manager
#[derive(Debug, Clone)]
pub struct LeaseState {
    pub role: Role,
    /// Bumped on every role change. Commits validate it, so a
    /// transaction begun under a lease that was later lost cannot
    /// surface.
    pub epoch: u64,
    /// Advertised address of the current primary, when known
    pub primary_url: Option<String>,
}

impl Default for LeaseState {
    fn default() -> Self {
        Self {
            role: Role::Follower,
            epoch: 0,
            primary_url: None,
        }
    }
}

pub struct Store {
    config: StoreConfig,
    dbs_dir: PathBuf,
    dbs: RwLock<HashMap<String, Arc<Database>>>,
    lease: Arc<RwLock<LeaseState>>,
    events: broadcast::Sender<StoreEvent>,
    invalidator: SharedInvalidator,
    shutdown: Arc<RwLock<bool>>,
}

impl Store {
    /// Open the store, restoring every database found under the data
    /// directory.
    pub async fn open(config: StoreConfig) -> Result<Arc<Self>> {
        let dbs_dir = config.data_dir.join("dbs");
        fs::create_dir_all(&dbs_dir).await?;
        let (events, _) = broadcast::channel(config.event_capacity);

        let store = Arc::new(Self {
            dbs_dir: dbs_dir.clone(),
            dbs: RwLock::new(HashMap::new()),
            lease: Arc::new(RwLock::new(LeaseState::default())),
            events,
            invalidator: Arc::new(RwLock::new(
                Arc::new(NoopInvalidator) as Arc<dyn PageCacheInvalidator>
            )),
            shutdown: Arc::new(RwLock::new(false)),
            config,
        });

        let mut restored = 0usize;
        let mut entries = fs::read_dir(&dbs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if validate_name(&name).is_err() {
                warn!(db = %name, "skipping directory with invalid database name");
                continue;
            }
            store.create_database(&name).await?;
            restored += 1;
        }

        info!(
            databases = restored,
            data_dir = %store.config.data_dir.display(),
            "store opened"
        );
        Ok(store)
    }

    /// Install the page cache invalidator used on the apply path
    pub fn set_invalidator(&self, invalidator: Arc<dyn PageCacheInvalidator>) {
        *self.invalidator.write() = invalidator;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn role(&self) -> Role {
        self.lease.read().role
    }

    pub fn epoch(&self) -> u64 {
        self.lease.read().epoch
    }

    pub fn primary_url(&self) -> Option<String> {
        self.lease.read().primary_url.clone()
    }

    pub fn lease_state(&self) -> LeaseState {
        self.lease.read().clone()
    }

    /// Promote this node. In-flight transactions begun under an older
    /// epoch fail at commit.
    pub fn set_primary(&self, advertise_url: String) {
        let epoch;
        {
            let mut lease = self.lease.write();
            if lease.role == Role::Primary
                && lease.primary_url.as_deref() == Some(advertise_url.as_str())
            {
                return;
            }
            lease.role = Role::Primary;
            lease.epoch += 1;
            lease.primary_url = Some(advertise_url.clone());
            epoch = lease.epoch;
        }
        info!(epoch, "promoted to primary");
        gauge!("mirrorfs_is_primary").set(1.0);
        let _ = self.events.send(StoreEvent::RoleChanged {
            role: Role::Primary,
            epoch,
        });
        let _ = self.events.send(StoreEvent::PrimaryChanged {
            url: Some(advertise_url),
        });
    }

    /// Demote this node, recording the current primary when known.
    /// Unconditional: open transactions fail at commit with `LeaseLost`.
    pub fn set_follower(&self, primary_url: Option<String>) {
        let was_primary;
        let url_changed;
        let epoch;
        {
            let mut lease = self.lease.write();
            was_primary = lease.role == Role::Primary;
            url_changed = lease.primary_url != primary_url;
            if !was_primary && !url_changed {
                return;
            }
            lease.role = Role::Follower;
            if was_primary {
                lease.epoch += 1;
            }
            lease.primary_url = primary_url.clone();
            epoch = lease.epoch;
        }
        if was_primary {
            warn!(epoch, "demoted to follower");
            gauge!("mirrorfs_is_primary").set(0.0);
            let _ = self.events.send(StoreEvent::RoleChanged {
                role: Role::Follower,
                epoch,
            });
        }
        if url_changed {
            debug!(primary = ?primary_url, "primary address changed");
            let _ = self.events.send(StoreEvent::PrimaryChanged { url: primary_url });
        }
    }

    /// Create a database or return the existing one
    pub async fn create_database(&self, name: &str) -> Result<Arc<Database>> {
        validate_name(name)?;
        if let Some(db) = self.dbs.read().get(name) {
            return Ok(Arc::clone(db));
        }

        let db = Database::open(
            name.to_string(),
            self.dbs_dir.join(name),
            self.config.busy_timeout,
            Arc::clone(&self.lease),
            self.events.clone(),
            Arc::clone(&self.invalidator),
        )
        .await?;

        {
            let mut dbs = self.dbs.write();
            if let Some(existing) = dbs.get(name) {
                return Ok(Arc::clone(existing));
            }
            dbs.insert(name.to_string(), Arc::clone(&db));
            gauge!("mirrorfs_databases").set(dbs.len() as f64);
        }

        info!(db = name, "database tracked");
        let _ = self.events.send(StoreEvent::DatabaseCreated {
            db: name.to_string(),
        });
        Ok(db)
    }

    pub fn database(&self, name: &str) -> Result<Arc<Database>> {
        self.dbs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NoSuchDatabase(name.to_string()))
    }

    pub fn databases(&self) -> Vec<Arc<Database>> {
        self.dbs.read().values().cloned().collect()
    }

    pub fn database_count(&self) -> usize {
        self.dbs.read().len()
    }

    /// Last durable position of every tracked database
    pub async fn positions(&self) -> BTreeMap<String, u64> {
        let dbs = self.databases();
        let mut positions = BTreeMap::new();
        for db in dbs {
            positions.insert(db.name().to_string(), db.position().await);
        }
        positions
    }

    /// Spawn periodic frame log retention enforcement
    pub fn start_retention(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(store.config.retention_interval);
            loop {
                ticker.tick().await;
                if *store.shutdown.read() {
                    break;
                }
                for db in store.databases() {
                    if let Err(e) = db.enforce_retention(store.config.retention_min_frames).await
                    {
                        warn!(db = db.name(), error = %e, "retention enforcement failed");
                    }
                }
            }
            debug!("retention loop stopped");
        });
    }

    pub fn shutdown(&self) {
        *self.shutdown.write() = true;
        info!("store shut down");
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("data_dir", &self.config.data_dir)
            .field("databases", &self.database_count())
            .finish()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidDatabaseName("empty name".to_string()));
    }
    if name.len() > MAX_DB_NAME_LENGTH {
        return Err(Error::InvalidDatabaseName(format!(
            "name longer than {MAX_DB_NAME_LENGTH} bytes"
        )));
    }
    if name.starts_with('.') || name.contains('/') || name.contains('\\') {
        return Err(Error::InvalidDatabaseName(name.to_string()));
    }
    Ok(())
}
