//! Invalidator implementations for embedders.
//!
//! The real OS binding (FUSE inode notification, fadvise) lives with
//! whatever mounts the filesystem. This module carries the recording
//! double used to assert invalidation ordering in tests.

use async_trait::async_trait;
use parking_lot::Mutex;

use mirrorfs_core::types::PageRange;
use mirrorfs_core::{PageCacheInvalidator, Result};

/// Records every invalidation call.
#[derive(Debug, Default)]
pub struct RecordingInvalidator {
    calls: Mutex<Vec<(String, Vec<PageRange>)>>,
}

impl RecordingInvalidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, Vec<PageRange>)> {
        self.calls.lock().clone()
    }

    /// Ranges invalidated for `db`, flattened across calls
    pub fn ranges_for(&self, db: &str) -> Vec<PageRange> {
        self.calls
            .lock()
            .iter()
            .filter(|(name, _)| name == db)
            .flat_map(|(_, ranges)| ranges.iter().copied())
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl PageCacheInvalidator for RecordingInvalidator {
    async fn invalidate(&self, db: &str, ranges: &[PageRange]) -> Result<()> {
        self.calls.lock().push((db.to_string(), ranges.to_vec()));
        Ok(())
    }
}
