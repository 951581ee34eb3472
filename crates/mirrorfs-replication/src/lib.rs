//! Mirrorfs replication
//!
//! The primary serves the ordered frame log to followers over HTTP;
//! followers pull frames and feed them to the store, falling back to a
//! full snapshot when their position is no longer retained.

pub mod client;
pub mod codec;
pub mod metrics;
pub mod protocol;
pub mod runner;
pub mod server;
mod stream;

pub use client::{ClientConfig, ReplicationClient};
pub use codec::FrameCodec;
pub use runner::FollowerRunner;
pub use server::ReplicationServer;
