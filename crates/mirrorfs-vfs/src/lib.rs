//! Mirrorfs Filesystem Intercept
//!
//! Watches the raw file operations a SQLite engine performs on a
//! tracked database's main file, rollback journal, and write-ahead log,
//! and turns the well-known operation sequences into transactions on
//! the store. An OS-level binding (FUSE, a custom VFS shim) routes the
//! tracked paths here and passes everything else straight through.

pub mod intercept;
pub mod notify;
pub mod sqlite;

pub use intercept::{FileKind, FsIntercept, OpenFlags, TxnPhase};
pub use notify::RecordingInvalidator;
