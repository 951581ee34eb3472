//! File operation interception.
//!
//! Maps the engine's file activity onto store transactions. A rollback
//! journal opened for writing begins a transaction; main-file writes
//! are collected invisibly while it is open; removing, truncating, or
//! header-zeroing the journal commits. In WAL mode, appended frames are
//! collected instead and the commit frame's nonzero database size
//! commits. Reads are served with the open transaction's pages overlaid
//! so the engine can spill and re-read its own uncommitted work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use mirrorfs_core::{Error, Result};
use mirrorfs_store::{Database, Store, WriteTxn};

use crate::sqlite::{
    is_journal_header, is_journal_header_zeroed, page_size_from_db_header,
    page_size_from_wal_header, WalFrameHeader, WAL_FRAME_HEADER_LEN, WAL_HEADER_LEN,
};

/// Which of a tracked database's files a path refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// The replicated database file itself
    Main,
    /// Rollback journal (`<db>-journal`)
    Journal,
    /// Write-ahead log (`<db>-wal`)
    Wal,
    /// Engine files the intercept does not manage (`<db>-shm`)
    Untracked,
}

impl FileKind {
    /// Split a file name into its database name and role
    pub fn classify(name: &str) -> (&str, FileKind) {
        if let Some(db) = name.strip_suffix("-journal") {
            (db, FileKind::Journal)
        } else if let Some(db) = name.strip_suffix("-wal") {
            (db, FileKind::Wal)
        } else if name.ends_with("-shm") {
            (name, FileKind::Untracked)
        } else {
            (name, FileKind::Main)
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }

    pub fn create() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            ..Self::default()
        }
    }
}

/// Per-database transaction detection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnPhase {
    /// No write transaction open
    Idle,
    /// Transaction begun, no pages collected yet
    Open,
    /// At least one page write collected
    Collecting,
}

/// Grow-on-write byte buffer standing in for a journal or WAL file
#[derive(Debug, Default)]
struct SparseBuf {
    data: Vec<u8>,
}

impl SparseBuf {
    fn write_at(&mut self, offset: u64, bytes: &[u8]) {
        let end = offset as usize + bytes.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[offset as usize..end].copy_from_slice(bytes);
    }

    fn read_at(&self, offset: u64, len: usize) -> Bytes {
        let start = (offset as usize).min(self.data.len());
        let end = start.saturating_add(len).min(self.data.len());
        Bytes::copy_from_slice(&self.data[start..end])
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn truncate(&mut self, len: u64) {
        self.data.truncate(len as usize);
    }

    fn clear(&mut self) {
        self.data.clear();
    }
}

struct DbTracker {
    txn: Option<WriteTxn>,
    phase: TxnPhase,
    journal: SparseBuf,
    wal: SparseBuf,
    /// Bytes of the WAL buffer already translated into page writes
    wal_consumed: u64,
    wal_page_size: Option<u32>,
    /// Page size declared by the main file header, learned from the
    /// first header write observed inside a transaction
    page_size: Option<u32>,
}

impl Default for DbTracker {
    fn default() -> Self {
        Self {
            txn: None,
            phase: TxnPhase::Idle,
            journal: SparseBuf::default(),
            wal: SparseBuf::default(),
            wal_consumed: 0,
            wal_page_size: None,
            page_size: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Handle {
    db: String,
    kind: FileKind,
    writable: bool,
}

/// Intercepts the file operations an OS binding routes here for the
/// tracked database paths. Everything else must pass through untouched.
pub struct FsIntercept {
    store: Arc<Store>,
    handles: Mutex<HashMap<u64, Handle>>,
    next_handle: AtomicU64,
    trackers: Mutex<HashMap<String, Arc<AsyncMutex<DbTracker>>>>,
}

impl FsIntercept {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            trackers: Mutex::new(HashMap::new()),
        }
    }

    fn tracker(&self, db: &str) -> Arc<AsyncMutex<DbTracker>> {
        Arc::clone(self.trackers.lock().entry(db.to_string()).or_default())
    }

    fn handle(&self, id: u64) -> Result<Handle> {
        self.handles
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("unknown file handle {id}")))
    }

    fn register(&self, handle: Handle) -> u64 {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(id, handle);
        id
    }

    /// Open a tracked file. Opening a journal for writing begins a write
    /// transaction, so on a follower it fails with `ReadOnly` before any
    /// page is touched.
    pub async fn open(&self, name: &str, flags: OpenFlags) -> Result<u64> {
        let (db_name, kind) = FileKind::classify(name);
        match kind {
            FileKind::Untracked => {
                return Err(Error::InvalidArgument(format!("untracked file: {name}")));
            }
            FileKind::Main => match self.store.database(db_name) {
                Ok(_) => {}
                Err(Error::NoSuchDatabase(_)) if flags.create => {
                    if !self.store.role().is_primary() {
                        return Err(Error::ReadOnly);
                    }
                    self.store.create_database(db_name).await?;
                }
                Err(e) => return Err(e),
            },
            FileKind::Journal => {
                let db = self.store.database(db_name)?;
                if flags.write {
                    let tracker = self.tracker(db_name);
                    let mut tracker = tracker.lock().await;
                    begin_journal(&mut tracker, &db).await?;
                    if flags.truncate {
                        tracker.journal.clear();
                    }
                }
            }
            FileKind::Wal => {
                self.store.database(db_name)?;
            }
        }

        let id = self.register(Handle {
            db: db_name.to_string(),
            kind,
            writable: flags.write,
        });
        debug!(file = name, handle = id, kind = ?kind, "opened");
        Ok(id)
    }

    /// Read from a tracked file. Reads never change transaction state
    /// and are never held for the duration of an open transaction.
    pub async fn read_at(&self, id: u64, offset: u64, len: usize) -> Result<Bytes> {
        let handle = self.handle(id)?;
        match handle.kind {
            FileKind::Main => {
                let db = self.store.database(&handle.db)?;
                let tracker = self.tracker(&handle.db);
                let tracker = tracker.lock().await;
                match &tracker.txn {
                    Some(txn) => overlay_read(&db, txn, offset, len).await,
                    None => db.read_at(offset, len).await,
                }
            }
            FileKind::Journal => {
                let tracker = self.tracker(&handle.db);
                let tracker = tracker.lock().await;
                Ok(tracker.journal.read_at(offset, len))
            }
            FileKind::Wal => {
                let tracker = self.tracker(&handle.db);
                let tracker = tracker.lock().await;
                Ok(tracker.wal.read_at(offset, len))
            }
            FileKind::Untracked => {
                Err(Error::InvalidArgument("untracked file".to_string()))
            }
        }
    }

    pub async fn write_at(&self, id: u64, offset: u64, data: &[u8]) -> Result<()> {
        let handle = self.handle(id)?;
        if !handle.writable {
            return Err(Error::InvalidArgument(
                "write on a read-only handle".to_string(),
            ));
        }
        match handle.kind {
            FileKind::Main => self.write_main(&handle.db, offset, data).await,
            FileKind::Journal => self.write_journal(&handle.db, offset, data).await,
            FileKind::Wal => self.write_wal(&handle.db, offset, data).await,
            FileKind::Untracked => {
                Err(Error::InvalidArgument("untracked file".to_string()))
            }
        }
    }

    async fn write_main(&self, db_name: &str, offset: u64, data: &[u8]) -> Result<()> {
        let db = self.store.database(db_name)?;
        let tracker = self.tracker(db_name);
        let mut tracker = tracker.lock().await;
        let tracker = &mut *tracker;

        if let Some(txn) = tracker.txn.as_mut() {
            if offset == 0 && tracker.page_size.is_none() {
                tracker.page_size = page_size_from_db_header(data);
            }
            // the engine writes whole pages; anything else would corrupt
            // the page ranges carried by the frame
            if let Some(page_size) = tracker.page_size {
                let page_size = u64::from(page_size);
                if offset % page_size != 0 || data.len() as u64 % page_size != 0 {
                    return Err(Error::InvalidArgument(format!(
                        "misaligned write of {} bytes at offset {offset} with page size {page_size}",
                        data.len()
                    )));
                }
            }
            txn.write(offset, Bytes::copy_from_slice(data));
            tracker.phase = TxnPhase::Collecting;
            return Ok(());
        }
        if !self.store.role().is_primary() {
            return Err(Error::ReadOnly);
        }
        if tracker.wal.len() > 0 {
            // checkpoint write-back of pages already carried by frames
            return db.checkpoint_write(offset, data).await;
        }
        Err(Error::InvalidArgument(
            "main file write outside a transaction".to_string(),
        ))
    }

    async fn write_journal(&self, db_name: &str, offset: u64, data: &[u8]) -> Result<()> {
        let db = self.store.database(db_name)?;
        let tracker = self.tracker(db_name);
        let mut tracker = tracker.lock().await;

        if tracker.txn.is_some() && offset == 0 && is_journal_header_zeroed(data) {
            // persistent-journal commit: the header is zeroed in place
            tracker.journal.write_at(offset, data);
            return finalize_journal(&mut tracker, db_name).await;
        }
        if tracker.txn.is_none() {
            if offset == 0 && is_journal_header(data) {
                // journal retained from an earlier transaction, reused
                // without a fresh write-open
                begin_journal(&mut tracker, &db).await?;
            } else if offset == 0 && is_journal_header_zeroed(data) {
                tracker.journal.write_at(offset, data);
                return Ok(());
            } else {
                return Err(Error::InvalidArgument(
                    "journal write outside a transaction".to_string(),
                ));
            }
        }
        tracker.journal.write_at(offset, data);
        Ok(())
    }

    async fn write_wal(&self, db_name: &str, offset: u64, data: &[u8]) -> Result<()> {
        let db = self.store.database(db_name)?;
        let tracker = self.tracker(db_name);
        let mut tracker = tracker.lock().await;

        if tracker.txn.is_none() && !self.store.role().is_primary() {
            return Err(Error::ReadOnly);
        }
        if offset == 0 {
            // header rewrite restarts the log
            tracker.wal.clear();
            tracker.wal_consumed = 0;
            tracker.wal_page_size = None;
        }
        tracker.wal.write_at(offset, data);
        scan_wal(&mut tracker, &db).await
    }

    pub async fn truncate(&self, id: u64, len: u64) -> Result<()> {
        let handle = self.handle(id)?;
        if !handle.writable {
            return Err(Error::InvalidArgument(
                "truncate on a read-only handle".to_string(),
            ));
        }
        match handle.kind {
            FileKind::Journal => {
                let tracker = self.tracker(&handle.db);
                let mut tracker = tracker.lock().await;
                tracker.journal.truncate(len);
                if len == 0 {
                    return finalize_journal(&mut tracker, &handle.db).await;
                }
                Ok(())
            }
            FileKind::Wal => {
                let tracker = self.tracker(&handle.db);
                let mut tracker = tracker.lock().await;
                tracker.wal.truncate(len);
                if len == 0 {
                    tracker.wal_consumed = 0;
                    tracker.wal_page_size = None;
                } else {
                    tracker.wal_consumed = tracker.wal_consumed.min(len);
                }
                Ok(())
            }
            FileKind::Main => {
                let db = self.store.database(&handle.db)?;
                db.truncate(len).await
            }
            FileKind::Untracked => {
                Err(Error::InvalidArgument("untracked file".to_string()))
            }
        }
    }

    /// Remove a tracked file. Removing the journal is the commit point
    /// of a delete-mode transaction.
    pub async fn unlink(&self, name: &str) -> Result<()> {
        let (db_name, kind) = FileKind::classify(name);
        match kind {
            FileKind::Journal => {
                let tracker = self.tracker(db_name);
                let mut tracker = tracker.lock().await;
                finalize_journal(&mut tracker, db_name).await
            }
            FileKind::Wal => {
                let tracker = self.tracker(db_name);
                let mut tracker = tracker.lock().await;
                if tracker.txn.is_some() {
                    return Err(Error::InvalidArgument(
                        "WAL removed mid-transaction".to_string(),
                    ));
                }
                tracker.wal.clear();
                tracker.wal_consumed = 0;
                tracker.wal_page_size = None;
                Ok(())
            }
            FileKind::Main => Err(Error::InvalidArgument(
                "cannot remove a replicated database file".to_string(),
            )),
            FileKind::Untracked => Err(Error::InvalidArgument(format!("untracked file: {name}"))),
        }
    }

    /// Journal renames finalize the transaction the same way a removal
    /// does; the engine uses them interchangeably on some platforms.
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let (db_name, kind) = FileKind::classify(from);
        if kind == FileKind::Journal {
            let tracker = self.tracker(db_name);
            let mut tracker = tracker.lock().await;
            return finalize_journal(&mut tracker, db_name).await;
        }
        Err(Error::InvalidArgument(format!(
            "unsupported rename: {from} -> {to}"
        )))
    }

    /// Durability is commit-scoped: frames and page write-back are
    /// synced by the store, so an engine fsync has nothing left to do.
    pub async fn sync(&self, id: u64) -> Result<()> {
        self.handle(id)?;
        Ok(())
    }

    /// Closing a handle never finalizes: a delete-mode commit closes the
    /// journal handle first and removes the file after.
    pub async fn close(&self, id: u64) -> Result<()> {
        let handle = self
            .handles
            .lock()
            .remove(&id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown file handle {id}")))?;
        debug!(handle = id, kind = ?handle.kind, "closed");
        Ok(())
    }

    /// Apparent file size, counting pages the open transaction has
    /// written past the durable end
    pub async fn size(&self, id: u64) -> Result<u64> {
        let handle = self.handle(id)?;
        match handle.kind {
            FileKind::Main => {
                let db = self.store.database(&handle.db)?;
                let durable = db.size().await?;
                let tracker = self.tracker(&handle.db);
                let tracker = tracker.lock().await;
                let pending_end = tracker
                    .txn
                    .as_ref()
                    .and_then(|txn| {
                        txn.pending()
                            .iter()
                            .next_back()
                            .map(|(offset, data)| offset + data.len() as u64)
                    })
                    .unwrap_or(0);
                Ok(durable.max(pending_end))
            }
            FileKind::Journal => {
                let tracker = self.tracker(&handle.db);
                let tracker = tracker.lock().await;
                Ok(tracker.journal.len())
            }
            FileKind::Wal => {
                let tracker = self.tracker(&handle.db);
                let tracker = tracker.lock().await;
                Ok(tracker.wal.len())
            }
            FileKind::Untracked => {
                Err(Error::InvalidArgument("untracked file".to_string()))
            }
        }
    }

    /// Abandon any open transaction for `db`, discarding collected pages
    /// and buffered journal and WAL state
    pub async fn abort(&self, db_name: &str) -> Result<()> {
        let tracker = self.tracker(db_name);
        let mut tracker = tracker.lock().await;
        tracker.journal.clear();
        tracker.wal.clear();
        tracker.wal_consumed = 0;
        tracker.wal_page_size = None;
        let Some(txn) = tracker.txn.take() else {
            return Ok(());
        };
        tracker.phase = TxnPhase::Idle;
        let pages = txn.pending().len();
        txn.rollback();
        warn!(db = db_name, pages, "open transaction aborted");
        Ok(())
    }

    /// Current transaction detection phase for `db`
    pub async fn phase(&self, db_name: &str) -> TxnPhase {
        let tracker = self.trackers.lock().get(db_name).cloned();
        match tracker {
            Some(tracker) => tracker.lock().await.phase,
            None => TxnPhase::Idle,
        }
    }
}

impl std::fmt::Debug for FsIntercept {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsIntercept")
            .field("open_handles", &self.handles.lock().len())
            .finish()
    }
}

async fn begin_journal(tracker: &mut DbTracker, db: &Arc<Database>) -> Result<()> {
    if tracker.txn.is_some() {
        return Ok(());
    }
    let txn = db.begin().await?;
    tracker.txn = Some(txn);
    tracker.phase = TxnPhase::Open;
    tracker.journal.clear();
    debug!(db = db.name(), "journal write opened, transaction begun");
    Ok(())
}

/// Commit point for rollback-journal transactions. A transaction that
/// collected no pages is closed without producing a frame.
async fn finalize_journal(tracker: &mut DbTracker, db_name: &str) -> Result<()> {
    tracker.journal.clear();
    let Some(txn) = tracker.txn.take() else {
        return Ok(());
    };
    tracker.phase = TxnPhase::Idle;
    if txn.is_empty() {
        txn.rollback();
        debug!(db = db_name, "journal finalized with no page writes");
        return Ok(());
    }
    let position = txn.commit().await?;
    info!(db = db_name, position, "journal finalized, transaction committed");
    Ok(())
}

/// Translate complete WAL frames into collected page writes, committing
/// when a frame carries the commit marker.
async fn scan_wal(tracker: &mut DbTracker, db: &Arc<Database>) -> Result<()> {
    if tracker.wal_page_size.is_none() {
        if tracker.wal.len() < WAL_HEADER_LEN as u64 {
            return Ok(());
        }
        let header = tracker.wal.read_at(0, WAL_HEADER_LEN);
        let page_size = page_size_from_wal_header(&header)
            .ok_or_else(|| Error::InvalidArgument("malformed WAL header".to_string()))?;
        tracker.wal_page_size = Some(page_size);
        tracker.wal_consumed = WAL_HEADER_LEN as u64;
    }
    let Some(page_size) = tracker.wal_page_size else {
        return Ok(());
    };
    let frame_len = WAL_FRAME_HEADER_LEN as u64 + page_size as u64;

    while tracker.wal.len() >= tracker.wal_consumed + frame_len {
        let head = tracker.wal.read_at(tracker.wal_consumed, WAL_FRAME_HEADER_LEN);
        let frame = WalFrameHeader::parse(&head)
            .ok_or_else(|| Error::InvalidArgument("malformed WAL frame header".to_string()))?;
        if frame.page_number == 0 {
            return Err(Error::InvalidArgument(
                "WAL frame with page number zero".to_string(),
            ));
        }
        let page = tracker.wal.read_at(
            tracker.wal_consumed + WAL_FRAME_HEADER_LEN as u64,
            page_size as usize,
        );

        if tracker.txn.is_none() {
            tracker.txn = Some(db.begin().await?);
            tracker.phase = TxnPhase::Open;
        }
        if let Some(txn) = tracker.txn.as_mut() {
            let file_offset = (frame.page_number as u64 - 1) * page_size as u64;
            txn.write(file_offset, page);
            tracker.phase = TxnPhase::Collecting;
        }
        tracker.wal_consumed += frame_len;

        if frame.is_commit() {
            if let Some(txn) = tracker.txn.take() {
                tracker.phase = TxnPhase::Idle;
                let position = txn.commit().await?;
                debug!(db = db.name(), position, "WAL commit frame applied");
            }
        }
    }
    Ok(())
}

/// Durable bytes with the open transaction's pages overlaid
async fn overlay_read(db: &Database, txn: &WriteTxn, offset: u64, len: usize) -> Result<Bytes> {
    let end = offset + len as u64;
    let durable = db.read_at(offset, len).await?;
    let mut buf = durable.to_vec();
    for (&page_off, data) in txn.pending().range(..end) {
        let page_end = page_off + data.len() as u64;
        let start_abs = page_off.max(offset);
        let end_abs = page_end.min(end);
        if end_abs <= start_abs {
            continue;
        }
        let dst = (start_abs - offset) as usize;
        let src = (start_abs - page_off) as usize;
        let n = (end_abs - start_abs) as usize;
        if buf.len() < dst + n {
            buf.resize(dst + n, 0);
        }
        buf[dst..dst + n].copy_from_slice(&data[src..src + n]);
    }
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::TempDir;

    use mirrorfs_core::types::StoreConfig;
    use crate::sqlite::{DB_HEADER_MAGIC, JOURNAL_MAGIC};

    async fn primary_store() -> (TempDir, Arc<Store>) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(StoreConfig {
            data_dir: dir.path().to_path_buf(),
            busy_timeout: Duration::from_millis(50),
            ..StoreConfig::default()
        })
        .await
        .unwrap();
        store.set_primary("http://localhost:20202".to_string());
        (dir, store)
    }

    fn journal_header() -> Vec<u8> {
        let mut header = vec![0u8; 512];
        header[..8].copy_from_slice(&JOURNAL_MAGIC);
        header
    }

    fn page_one(fill: u8) -> Vec<u8> {
        let mut page = vec![fill; 4096];
        page[..16].copy_from_slice(DB_HEADER_MAGIC);
        page[16..18].copy_from_slice(&4096u16.to_be_bytes());
        page
    }

    fn wal_header(page_size: u32) -> Vec<u8> {
        let mut header = vec![0u8; WAL_HEADER_LEN];
        header[..4].copy_from_slice(&0x377f_0682u32.to_be_bytes());
        header[4..8].copy_from_slice(&3_007_000u32.to_be_bytes());
        header[8..12].copy_from_slice(&page_size.to_be_bytes());
        header
    }

    fn wal_frame(page_number: u32, db_size: u32, fill: u8, page_size: usize) -> Vec<u8> {
        let mut frame = vec![0u8; WAL_FRAME_HEADER_LEN + page_size];
        frame[..4].copy_from_slice(&page_number.to_be_bytes());
        frame[4..8].copy_from_slice(&db_size.to_be_bytes());
        frame[WAL_FRAME_HEADER_LEN..].fill(fill);
        frame
    }

    #[test]
    fn test_classify() {
        assert_eq!(FileKind::classify("app.db"), ("app.db", FileKind::Main));
        assert_eq!(
            FileKind::classify("app.db-journal"),
            ("app.db", FileKind::Journal)
        );
        assert_eq!(FileKind::classify("app.db-wal"), ("app.db", FileKind::Wal));
        assert_eq!(
            FileKind::classify("app.db-shm"),
            ("app.db-shm", FileKind::Untracked)
        );
    }

    #[test]
    fn test_sparse_buf() {
        let mut buf = SparseBuf::default();
        buf.write_at(4, b"abcd");
        assert_eq!(buf.len(), 8);
        assert_eq!(&buf.read_at(0, 8)[..], &[0, 0, 0, 0, b'a', b'b', b'c', b'd']);
        assert_eq!(&buf.read_at(6, 10)[..], b"cd");
        assert!(buf.read_at(100, 4).is_empty());
        buf.truncate(5);
        assert_eq!(buf.len(), 5);
        buf.clear();
        assert_eq!(buf.len(), 0);
    }

    #[tokio::test]
    async fn test_journal_commit_cycle() {
        let (_dir, store) = primary_store().await;
        let fs = FsIntercept::new(Arc::clone(&store));

        let main = fs.open("app.db", OpenFlags::create()).await.unwrap();
        let db = store.database("app.db").unwrap();

        let journal = fs.open("app.db-journal", OpenFlags::create()).await.unwrap();
        assert_eq!(fs.phase("app.db").await, TxnPhase::Open);
        fs.write_at(journal, 0, &journal_header()).await.unwrap();
        assert_eq!(&fs.read_at(journal, 0, 8).await.unwrap()[..], &JOURNAL_MAGIC);

        fs.write_at(main, 0, &page_one(0xAA)).await.unwrap();
        fs.write_at(main, 4096, &[0xBB; 4096]).await.unwrap();
        assert_eq!(fs.phase("app.db").await, TxnPhase::Collecting);

        // the writer sees its own pages, the durable file does not
        let through = fs.read_at(main, 4096, 4096).await.unwrap();
        assert_eq!(&through[..], &[0xBB; 4096]);
        assert!(db.read_at(4096, 4096).await.unwrap().is_empty());
        assert_eq!(fs.size(main).await.unwrap(), 8192);
        assert_eq!(db.position().await, 0);

        // delete-mode commit: handle closed first, then the file removed
        fs.close(journal).await.unwrap();
        assert_eq!(fs.phase("app.db").await, TxnPhase::Collecting);
        fs.unlink("app.db-journal").await.unwrap();

        assert_eq!(fs.phase("app.db").await, TxnPhase::Idle);
        assert_eq!(db.position().await, 1);
        assert_eq!(&db.read_at(0, 16).await.unwrap()[..], &DB_HEADER_MAGIC[..]);
        assert_eq!(&db.read_at(4096, 4096).await.unwrap()[..], &[0xBB; 4096]);
        assert!(matches!(
            fs.size(journal).await.unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn test_misaligned_main_write_rejected() {
        let (_dir, store) = primary_store().await;
        let fs = FsIntercept::new(Arc::clone(&store));
        let main = fs.open("app.db", OpenFlags::create()).await.unwrap();
        let db = store.database("app.db").unwrap();

        let journal = fs.open("app.db-journal", OpenFlags::create()).await.unwrap();
        fs.write_at(journal, 0, &journal_header()).await.unwrap();
        // the header write declares the 4096-byte page size
        fs.write_at(main, 0, &page_one(0xAA)).await.unwrap();

        let err = fs.write_at(main, 4096, &[0xBB; 100]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        let err = fs.write_at(main, 100, &[0xBB; 4096]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        // a whole page at a page boundary still goes through
        fs.write_at(main, 4096, &[0xBB; 4096]).await.unwrap();
        fs.unlink("app.db-journal").await.unwrap();
        assert_eq!(db.position().await, 1);
        assert_eq!(&db.read_at(4096, 4096).await.unwrap()[..], &[0xBB; 4096]);
    }

    #[tokio::test]
    async fn test_journal_finalize_without_pages_produces_no_frame() {
        let (_dir, store) = primary_store().await;
        let fs = FsIntercept::new(Arc::clone(&store));
        fs.open("app.db", OpenFlags::create()).await.unwrap();

        let journal = fs.open("app.db-journal", OpenFlags::create()).await.unwrap();
        fs.write_at(journal, 0, &journal_header()).await.unwrap();
        fs.unlink("app.db-journal").await.unwrap();

        assert_eq!(store.database("app.db").unwrap().position().await, 0);
        assert_eq!(fs.phase("app.db").await, TxnPhase::Idle);
    }

    #[tokio::test]
    async fn test_follower_write_open_rejected_before_any_page() {
        let (_dir, store) = primary_store().await;
        store.create_database("app.db").await.unwrap();
        store.set_follower(None);
        let fs = FsIntercept::new(Arc::clone(&store));

        let err = fs.open("app.db-journal", OpenFlags::create()).await.unwrap_err();
        assert!(matches!(err, Error::ReadOnly));
        assert_eq!(fs.phase("app.db").await, TxnPhase::Idle);
        assert_eq!(store.database("app.db").unwrap().position().await, 0);

        // creating a brand-new database is a write as well
        let err = fs.open("other.db", OpenFlags::create()).await.unwrap_err();
        assert!(matches!(err, Error::ReadOnly));

        // reads still pass
        let main = fs.open("app.db", OpenFlags::read_only()).await.unwrap();
        assert!(fs.read_at(main, 0, 100).await.unwrap().is_empty());
        assert_eq!(fs.phase("app.db").await, TxnPhase::Idle);
    }

    #[tokio::test]
    async fn test_second_writer_gets_busy() {
        let (_dir, store) = primary_store().await;
        let fs = FsIntercept::new(Arc::clone(&store));
        fs.open("app.db", OpenFlags::create()).await.unwrap();
        let db = store.database("app.db").unwrap();

        let held = db.begin().await.unwrap();
        let err = fs.open("app.db-journal", OpenFlags::create()).await.unwrap_err();
        assert!(matches!(err, Error::Busy));
        held.rollback();

        // writer released, the journal opens now
        fs.open("app.db-journal", OpenFlags::create()).await.unwrap();
        assert_eq!(fs.phase("app.db").await, TxnPhase::Open);
    }

    #[tokio::test]
    async fn test_persistent_journal_header_zero_commits() {
        let (_dir, store) = primary_store().await;
        let fs = FsIntercept::new(Arc::clone(&store));
        let main = fs.open("app.db", OpenFlags::create()).await.unwrap();
        let db = store.database("app.db").unwrap();

        let journal = fs.open("app.db-journal", OpenFlags::create()).await.unwrap();
        fs.write_at(journal, 0, &journal_header()).await.unwrap();
        fs.write_at(main, 0, &page_one(0x11)).await.unwrap();
        fs.write_at(journal, 0, &[0u8; 28]).await.unwrap();
        assert_eq!(db.position().await, 1);
        assert_eq!(fs.phase("app.db").await, TxnPhase::Idle);

        // the retained journal starts the next transaction with a plain
        // header write, no reopen
        fs.write_at(journal, 0, &journal_header()).await.unwrap();
        assert_eq!(fs.phase("app.db").await, TxnPhase::Open);
        fs.write_at(main, 0, &page_one(0x22)).await.unwrap();
        fs.write_at(journal, 0, &[0u8; 28]).await.unwrap();
        assert_eq!(db.position().await, 2);
        assert_eq!(db.read_at(20, 1).await.unwrap()[0], 0x22);
    }

    #[tokio::test]
    async fn test_truncate_mode_commit() {
        let (_dir, store) = primary_store().await;
        let fs = FsIntercept::new(Arc::clone(&store));
        let main = fs.open("app.db", OpenFlags::create()).await.unwrap();
        let db = store.database("app.db").unwrap();

        let journal = fs.open("app.db-journal", OpenFlags::create()).await.unwrap();
        fs.write_at(journal, 0, &journal_header()).await.unwrap();
        fs.write_at(main, 0, &page_one(0x33)).await.unwrap();
        fs.truncate(journal, 0).await.unwrap();

        assert_eq!(db.position().await, 1);
        assert_eq!(fs.size(journal).await.unwrap(), 0);
        assert_eq!(fs.phase("app.db").await, TxnPhase::Idle);
    }

    #[tokio::test]
    async fn test_wal_commit_detection() {
        let (_dir, store) = primary_store().await;
        let fs = FsIntercept::new(Arc::clone(&store));
        fs.open("app.db", OpenFlags::create()).await.unwrap();
        let db = store.database("app.db").unwrap();

        let wal = fs.open("app.db-wal", OpenFlags::create()).await.unwrap();
        let frame1 = wal_frame(2, 0, 0xBB, 4096);
        let frame2 = wal_frame(1, 2, 0xAA, 4096);

        // header plus a partial frame: nothing to translate yet
        let mut first = wal_header(4096);
        first.extend_from_slice(&frame1[..2000]);
        fs.write_at(wal, 0, &first).await.unwrap();
        assert_eq!(fs.phase("app.db").await, TxnPhase::Idle);

        // completing the frame opens the transaction and collects it
        fs.write_at(wal, 32 + 2000, &frame1[2000..]).await.unwrap();
        assert_eq!(fs.phase("app.db").await, TxnPhase::Collecting);
        assert_eq!(db.position().await, 0);

        // commit frame: nonzero database size
        fs.write_at(wal, 32 + 4120, &frame2).await.unwrap();
        assert_eq!(fs.phase("app.db").await, TxnPhase::Idle);
        assert_eq!(db.position().await, 1);
        assert_eq!(db.read_at(0, 1).await.unwrap()[0], 0xAA);
        assert_eq!(db.read_at(4096, 1).await.unwrap()[0], 0xBB);
    }

    #[tokio::test]
    async fn test_wal_checkpoint_write_back() {
        let (_dir, store) = primary_store().await;
        let fs = FsIntercept::new(Arc::clone(&store));
        let main = fs.open("app.db", OpenFlags::create()).await.unwrap();
        let db = store.database("app.db").unwrap();

        let wal = fs.open("app.db-wal", OpenFlags::create()).await.unwrap();
        let mut log = wal_header(4096);
        log.extend_from_slice(&wal_frame(1, 1, 0xAA, 4096));
        fs.write_at(wal, 0, &log).await.unwrap();
        assert_eq!(db.position().await, 1);

        // the engine copies the committed page back into the main file
        fs.write_at(main, 0, &[0xAA; 4096]).await.unwrap();
        assert_eq!(db.position().await, 1);
        assert_eq!(db.read_at(0, 1).await.unwrap()[0], 0xAA);

        // log reset ends checkpoint mode
        fs.truncate(wal, 0).await.unwrap();
        let err = fs.write_at(main, 0, &[0xCC; 4096]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_abort_discards_open_transaction() {
        let (_dir, store) = primary_store().await;
        let fs = FsIntercept::new(Arc::clone(&store));
        let main = fs.open("app.db", OpenFlags::create()).await.unwrap();
        let db = store.database("app.db").unwrap();

        let journal = fs.open("app.db-journal", OpenFlags::create()).await.unwrap();
        fs.write_at(journal, 0, &journal_header()).await.unwrap();
        fs.write_at(main, 0, &page_one(0x55)).await.unwrap();

        fs.abort("app.db").await.unwrap();
        assert_eq!(fs.phase("app.db").await, TxnPhase::Idle);
        assert_eq!(db.position().await, 0);
        assert!(db.read_at(0, 16).await.unwrap().is_empty());

        // a fresh cycle works after the abandoned transaction
        let journal = fs.open("app.db-journal", OpenFlags::create()).await.unwrap();
        fs.write_at(journal, 0, &journal_header()).await.unwrap();
        fs.write_at(main, 0, &page_one(0x66)).await.unwrap();
        fs.unlink("app.db-journal").await.unwrap();
        assert_eq!(db.position().await, 1);
    }

    #[tokio::test]
    async fn test_untracked_and_unknown_handles() {
        let (_dir, store) = primary_store().await;
        let fs = FsIntercept::new(Arc::clone(&store));

        let err = fs.open("app.db-shm", OpenFlags::read_write()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = fs.read_at(42, 0, 10).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = fs.open("missing.db", OpenFlags::read_only()).await.unwrap_err();
        assert!(matches!(err, Error::NoSuchDatabase(_)));
    }

    #[tokio::test]
    async fn test_main_unlink_rejected() {
        let (_dir, store) = primary_store().await;
        let fs = FsIntercept::new(Arc::clone(&store));
        fs.open("app.db", OpenFlags::create()).await.unwrap();
        let err = fs.unlink("app.db").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
