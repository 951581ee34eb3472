//! Shared types for mirrorfs

pub mod common;
pub mod frame;

pub use common::{
    headers, LeaseBackend, LeaseConfig, PageRange, ReplicationConfig, Role, StoreConfig,
};
pub use frame::{FramePage, TransactionFrame, FRAME_HEADER_LEN, FRAME_MAGIC, FRAME_TRAILER_LEN};
