//! Per-database transaction state machine
//!
//! One [`Database`] per tracked file. On the primary it serializes write
//! transactions behind a single writer gate and turns each commit into a
//! frame; on followers it applies frames in strict position order and
//! keeps the file byte-identical to the primary's.

use std::collections::BTreeMap;
use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use parking_lot::RwLock;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use mirrorfs_core::types::{FramePage, PageRange, Role, TransactionFrame};
use mirrorfs_core::{Error, PageCacheInvalidator, Result};

use crate::events::StoreEvent;
use crate::log::FrameLog;
use crate::store::LeaseState;

pub(crate) type SharedInvalidator = Arc<RwLock<Arc<dyn PageCacheInvalidator>>>;

const DB_FILE: &str = "database";

/// State guarded by the per-database critical section. Commits and
/// applies both run under it, so position movement is serialized.
struct DbInner {
    /// Last durable position: committed on the primary, applied on a
    /// follower. Zero for an empty database.
    position: u64,
    /// Lowest retained frame position; `position + 1` when the log holds
    /// nothing
    retained_floor: u64,
}

pub struct Database {
    name: String,
    dir: PathBuf,
    file_path: PathBuf,
    log: FrameLog,
    inner: Mutex<DbInner>,
    /// Writer gate, held for the lifetime of an open write transaction.
    /// Tokio mutexes queue waiters in FIFO order, so a second writer
    /// blocks behind the first instead of spinning.
    writer: Arc<Mutex<()>>,
    busy_timeout: Duration,
    out_of_sync: AtomicBool,
    lease: Arc<RwLock<LeaseState>>,
    events: broadcast::Sender<StoreEvent>,
    invalidator: SharedInvalidator,
}

impl Database {
    /// Open or create the database directory, then roll forward any
    /// frames that became durable after the last recorded position.
    pub(crate) async fn open(
        name: String,
        dir: PathBuf,
        busy_timeout: Duration,
        lease: Arc<RwLock<LeaseState>>,
        events: broadcast::Sender<StoreEvent>,
        invalidator: SharedInvalidator,
    ) -> Result<Arc<Self>> {
        fs::create_dir_all(&dir).await?;
        let log = FrameLog::new(&dir);
        log.init().await?;

        let file_path = dir.join(DB_FILE);
        if fs::metadata(&file_path).await.is_err() {
            fs::File::create(&file_path).await?.sync_all().await?;
        }

        let mut position = log.read_marker().await?.unwrap_or(0);
        let bounds = log.bounds().await?;

        // recovery: a crash may have left durable frames past the marker
        if let Some((_, max)) = bounds {
            while position < max {
                let next = position + 1;
                match log.read_frame(next).await {
                    Ok(Some(frame)) => {
                        write_pages_to(&file_path, &frame.pages).await?;
                        log.write_marker(next).await?;
                        position = next;
                        info!(db = %name, position, "rolled forward frame during recovery");
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(db = %name, position = next, error = %e, "stopping recovery at unreadable frame");
                        break;
                    }
                }
            }
            // anything past the recovered position is unreachable
            for orphan in position + 1..=max {
                log.remove(orphan).await?;
            }
        }

        let retained_floor = match log.bounds().await? {
            Some((min, _)) => min,
            None => position + 1,
        };

        Ok(Arc::new(Self {
            name,
            file_path,
            dir,
            log,
            inner: Mutex::new(DbInner {
                position,
                retained_floor,
            }),
            writer: Arc::new(Mutex::new(())),
            busy_timeout,
            out_of_sync: AtomicBool::new(false),
            lease,
            events,
            invalidator,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the replicated database file
    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub async fn position(&self) -> u64 {
        self.inner.lock().await.position
    }

    pub async fn retained_floor(&self) -> u64 {
        self.inner.lock().await.retained_floor
    }

    pub fn is_out_of_sync(&self) -> bool {
        self.out_of_sync.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_out_of_sync(&self, reason: &str) {
        self.out_of_sync.store(true, Ordering::SeqCst);
        warn!(db = %self.name, reason, "database marked out of sync");
        counter!("mirrorfs_out_of_sync_total", "db" => self.name.clone()).increment(1);
    }

    fn lease_state(&self) -> (Role, u64) {
        let lease = self.lease.read();
        (lease.role, lease.epoch)
    }

    /// Open a write transaction. Fails with `ReadOnly` off the primary,
    /// waits up to the busy timeout behind an open transaction and then
    /// fails with `Busy`.
    pub async fn begin(self: &Arc<Self>) -> Result<WriteTxn> {
        let (role, _) = self.lease_state();
        if role != Role::Primary {
            return Err(Error::ReadOnly);
        }
        if self.is_out_of_sync() {
            return Err(Error::OutOfSync(self.name.clone()));
        }

        let guard = match tokio::time::timeout(
            self.busy_timeout,
            Arc::clone(&self.writer).lock_owned(),
        )
        .await
        {
            Ok(guard) => guard,
            Err(_) => return Err(Error::Busy),
        };

        // the node may have been demoted while we waited
        let (role, epoch) = self.lease_state();
        if role != Role::Primary {
            return Err(Error::ReadOnly);
        }

        debug!(db = %self.name, "write transaction opened");
        Ok(WriteTxn {
            db: Arc::clone(self),
            epoch,
            pages: BTreeMap::new(),
            _guard: guard,
        })
    }

    /// Apply a replicated frame. Frames must arrive in strict position
    /// order; the page cache is invalidated before the apply lock is
    /// released so no reader can observe stale bytes.
    pub async fn apply_frame(&self, frame: TransactionFrame) -> Result<()> {
        if self.is_out_of_sync() {
            return Err(Error::OutOfSync(self.name.clone()));
        }
        let (role, _) = self.lease_state();
        if role == Role::Primary {
            return Err(Error::Internal(
                "cannot apply replicated frames while primary".to_string(),
            ));
        }
        frame.verify()?;

        let mut inner = self.inner.lock().await;
        let expected = inner.position + 1;
        if frame.position != expected {
            return Err(Error::PositionGap {
                expected,
                got: frame.position,
            });
        }

        self.log.append(frame.position, &frame.encode()).await?;
        if let Err(e) = self.write_pages(&frame.pages).await {
            self.log.remove(frame.position).await?;
            return Err(e);
        }

        let ranges = frame.ranges();
        let invalidator = self.invalidator.read().clone();
        if let Err(e) = invalidator.invalidate(&self.name, &ranges).await {
            self.mark_out_of_sync("page cache invalidation failed");
            return Err(Error::InvalidationFailed(e.to_string()));
        }

        inner.position = frame.position;
        self.log.write_marker(frame.position).await?;
        drop(inner);

        counter!("mirrorfs_frames_applied_total", "db" => self.name.clone()).increment(1);
        debug!(db = %self.name, position = frame.position, pages = frame.pages.len(), "applied frame");
        let _ = self.events.send(StoreEvent::Commit {
            db: self.name.clone(),
            frame: Arc::new(frame),
        });
        Ok(())
    }

    async fn write_pages(&self, pages: &[FramePage]) -> Result<()> {
        write_pages_to(&self.file_path, pages).await
    }

    /// Raw encoded frame at `position`, already checksummed on disk
    pub async fn frame_bytes(&self, position: u64) -> Result<Option<Bytes>> {
        self.log.read(position).await
    }

    /// Read from the durable database file. Out-of-sync databases are
    /// off the read path entirely.
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        if self.is_out_of_sync() {
            return Err(Error::OutOfSync(self.name.clone()));
        }
        let mut file = fs::File::open(&self.file_path).await?;
        let size = file.metadata().await?.len();
        if offset >= size {
            return Ok(Bytes::new());
        }
        let available = ((size - offset) as usize).min(len);
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; available];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    pub async fn size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.file_path).await?.len())
    }

    /// Point-in-time copy of the database file with its position.
    /// Holds the critical section so no commit or apply tears the copy.
    pub async fn snapshot(&self) -> Result<(Bytes, u64)> {
        let inner = self.inner.lock().await;
        let data = fs::read(&self.file_path).await?;
        Ok((Bytes::from(data), inner.position))
    }

    /// Replace the database wholesale from a primary snapshot taken at
    /// `position`. Clears any out-of-sync condition.
    pub async fn install_snapshot(&self, data: &[u8], position: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let tmp = self.dir.join("database.tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.file_path).await?;

        self.log.reset(position).await?;
        inner.position = position;
        inner.retained_floor = position + 1;

        let invalidator = self.invalidator.read().clone();
        let whole = [PageRange::new(0, data.len() as u64)];
        if let Err(e) = invalidator.invalidate(&self.name, &whole).await {
            self.mark_out_of_sync("page cache invalidation failed after snapshot");
            return Err(Error::InvalidationFailed(e.to_string()));
        }
        self.out_of_sync.store(false, Ordering::SeqCst);
        drop(inner);

        counter!("mirrorfs_snapshots_installed_total", "db" => self.name.clone()).increment(1);
        info!(db = %self.name, position, bytes = data.len(), "snapshot installed");
        Ok(())
    }

    /// Write already-committed pages straight to the file, outside any
    /// transaction. Used for WAL checkpoint write-back on the primary;
    /// the pages were replicated by the frames that carried them.
    pub async fn checkpoint_write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let (role, _) = self.lease_state();
        if role != Role::Primary {
            return Err(Error::ReadOnly);
        }
        let _inner = self.inner.lock().await;
        let mut file = fs::OpenOptions::new().write(true).open(&self.file_path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Shrink the database file. Truncation is not carried by frames;
    /// followers converge through the page count in the file header.
    pub async fn truncate(&self, len: u64) -> Result<()> {
        let (role, _) = self.lease_state();
        if role != Role::Primary {
            return Err(Error::ReadOnly);
        }
        let _inner = self.inner.lock().await;
        let file = fs::OpenOptions::new().write(true).open(&self.file_path).await?;
        file.set_len(len).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Delete old frames, keeping at least `min_frames` recent ones.
    /// Returns the number removed.
    pub async fn enforce_retention(&self, min_frames: u64) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        if inner.position <= min_frames {
            return Ok(0);
        }
        let floor = inner.position - min_frames + 1;
        if floor <= inner.retained_floor {
            return Ok(0);
        }
        let removed = self.log.trim_below(floor).await?;
        inner.retained_floor = floor;
        drop(inner);
        if removed > 0 {
            debug!(db = %self.name, floor, removed, "trimmed frame log");
            counter!("mirrorfs_frames_trimmed_total", "db" => self.name.clone())
                .increment(removed);
        }
        Ok(removed)
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("path", &self.file_path)
            .finish()
    }
}

async fn write_pages_to(path: &Path, pages: &[FramePage]) -> Result<()> {
    let mut file = fs::OpenOptions::new().write(true).open(path).await?;
    for page in pages {
        file.seek(SeekFrom::Start(page.offset)).await?;
        file.write_all(&page.data).await?;
    }
    file.sync_all().await?;
    Ok(())
}

/// An open write transaction on a primary database.
///
/// Page writes accumulate in memory with no external visibility until
/// `commit`. Dropping the handle discards them and releases the writer
/// gate.
pub struct WriteTxn {
    db: Arc<Database>,
    /// Lease epoch at begin; commit fails with `LeaseLost` if it moved
    epoch: u64,
    pages: BTreeMap<u64, Bytes>,
    _guard: OwnedMutexGuard<()>,
}

impl WriteTxn {
    pub fn db_name(&self) -> &str {
        &self.db.name
    }

    /// Stage a write. A later write to the same offset replaces the
    /// earlier one.
    pub fn write(&mut self, offset: u64, data: impl Into<Bytes>) {
        self.pages.insert(offset, data.into());
    }

    /// Staged bytes at exactly `offset`, if any
    pub fn page_at(&self, offset: u64) -> Option<&Bytes> {
        self.pages.get(&offset)
    }

    /// All staged writes, keyed by offset
    pub fn pending(&self) -> &BTreeMap<u64, Bytes> {
        &self.pages
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn dirty_bytes(&self) -> usize {
        self.pages.values().map(|d| d.len()).sum()
    }

    /// Make the transaction durable and broadcast it. Returns the new
    /// position. An empty transaction commits nothing and returns the
    /// current position.
    pub async fn commit(mut self) -> Result<u64> {
        let staged = std::mem::take(&mut self.pages);
        let db = Arc::clone(&self.db);

        let mut inner = db.inner.lock().await;
        if staged.is_empty() {
            return Ok(inner.position);
        }

        {
            let lease = db.lease.read();
            if lease.role != Role::Primary || lease.epoch != self.epoch {
                return Err(Error::LeaseLost);
            }
        }

        let position = inner.position + 1;
        let pages: Vec<FramePage> = staged
            .into_iter()
            .map(|(offset, data)| FramePage::new(offset, data))
            .collect();
        let frame = TransactionFrame::new(position, pages);

        db.log.append(position, &frame.encode()).await?;
        if let Err(e) = db.write_pages(&frame.pages).await {
            db.log.remove(position).await?;
            return Err(e);
        }

        // A demotion while writing must not let this commit surface. The
        // file already holds pages no other node will ever see, so the
        // database has to be rebuilt from the new primary's snapshot.
        {
            let lease = db.lease.read();
            if lease.role != Role::Primary || lease.epoch != self.epoch {
                drop(lease);
                db.log.remove(position).await?;
                db.mark_out_of_sync("demoted mid-commit with pages already written");
                return Err(Error::LeaseLost);
            }
        }

        inner.position = position;
        db.log.write_marker(position).await?;
        drop(inner);

        counter!("mirrorfs_commits_total", "db" => db.name.clone()).increment(1);
        debug!(db = %db.name, position, pages = frame.pages.len(), "transaction committed");
        let _ = db.events.send(StoreEvent::Commit {
            db: db.name.clone(),
            frame: Arc::new(frame),
        });
        Ok(position)
    }

    /// Discard every staged write and release the writer gate
    pub fn rollback(mut self) {
        self.pages.clear();
        debug!(db = %self.db.name, "transaction rolled back");
    }
}

impl fmt::Debug for WriteTxn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteTxn")
            .field("db", &self.db.name)
            .field("dirty_pages", &self.pages.len())
            .finish()
    }
}

impl Drop for WriteTxn {
    fn drop(&mut self) {
        if !self.pages.is_empty() {
            debug!(db = %self.db.name, pages = self.pages.len(), "write transaction dropped uncommitted");
        }
    }
}
