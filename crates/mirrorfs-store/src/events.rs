//! Store event bus

use std::sync::Arc;

use mirrorfs_core::types::{Role, TransactionFrame};

/// Broadcast to every subscriber of [`crate::Store::subscribe`].
///
/// Commit events carry the frame behind an `Arc` so fan-out to many
/// follower streams never copies page data.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A database appeared, either created locally or discovered from
    /// the primary
    DatabaseCreated { db: String },
    /// The node's role changed
    RoleChanged { role: Role, epoch: u64 },
    /// The advertised primary address changed
    PrimaryChanged { url: Option<String> },
    /// A frame became durable: committed on the primary or applied on a
    /// follower
    Commit {
        db: String,
        frame: Arc<TransactionFrame>,
    },
}

impl StoreEvent {
    pub fn is_commit_for(&self, db: &str) -> bool {
        matches!(self, StoreEvent::Commit { db: name, .. } if name == db)
    }
}
