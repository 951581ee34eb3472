//! Mirrorfs Transaction Store
//!
//! Per-database authority over role, the ordered frame log, and frame
//! application. [`Store`] owns every tracked database, [`Database`] runs
//! the single-writer transaction state machine, and [`FrameLog`]
//! persists frames on disk.

pub mod db;
pub mod events;
pub mod log;
pub mod store;

pub use db::{Database, WriteTxn};
pub use events::StoreEvent;
pub use log::FrameLog;
pub use store::{LeaseState, Store};
