//! Mirrorfs Core Library
//!
//! Shared types, errors, and configuration for the mirrorfs replicated
//! database file service.

pub mod config;
pub mod error;
pub mod invalidator;
pub mod types;

pub use config::MirrorfsConfig;
pub use error::{Error, ErrorBody, Result};
pub use invalidator::{NoopInvalidator, PageCacheInvalidator};

/// Mirrorfs version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Largest page size a database header may declare (64 KiB)
pub const MAX_PAGE_SIZE: u32 = 65536;

/// Maximum database name length in bytes
pub const MAX_DB_NAME_LENGTH: usize = 128;
