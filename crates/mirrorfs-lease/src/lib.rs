//! Leadership election over a pluggable lease backend
//!
//! At most one node holds the lease at any instant, and the holder is
//! the primary. The manager renews at a third of the TTL and treats any
//! renewal failure as loss of leadership, trading availability for the
//! guarantee that two primaries never coexist.

mod http;
mod leaser;
mod local;
mod manager;

pub use http::{HttpLeaser, HttpLeaserConfig};
pub use leaser::{Lease, Leaser, PrimaryInfo};
pub use local::{MemoryLeaser, StaticLeaser};
pub use manager::{LeaseEvent, LeaseManager};
