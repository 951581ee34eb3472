//! Page cache invalidation seam
//!
//! After a follower applies a frame, any cached pages covering the
//! changed ranges must be dropped before readers can run again. The OS
//! binding supplies the implementation; the store only sees this trait.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::PageRange;

#[async_trait]
pub trait PageCacheInvalidator: Send + Sync {
    /// Drop cached pages for the given ranges of a database file.
    ///
    /// Must not return until every range is invalidated. A failure marks
    /// the database out of sync and takes it off the read path.
    async fn invalidate(&self, db: &str, ranges: &[PageRange]) -> Result<()>;
}

/// Invalidator for deployments without an OS page cache binding
#[derive(Debug, Default, Clone)]
pub struct NoopInvalidator;

#[async_trait]
impl PageCacheInvalidator for NoopInvalidator {
    async fn invalidate(&self, _db: &str, _ranges: &[PageRange]) -> Result<()> {
        Ok(())
    }
}
