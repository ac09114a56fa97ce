//! Snapshot regions and the per-world region cache.
//!
//! # Invariants
//! - At most one resident region instance per coordinate; concurrent first
//!   accesses share a single load.
//! - Operations on the same cell never overlap and run in submission order.
//! - A region leaves memory only after a successful flush, or through an
//!   explicit wipe.
//! - A region is never evicted while an operation against it is in flight.

mod cache;
mod config;
mod region;
mod service;

pub use cache::{CacheError, CacheStats, RegionCache};
pub use config::{CacheConfig, ServiceConfig};
pub use region::SnapshotRegion;
pub use service::SnapshotService;

pub fn crate_info() -> &'static str {
    "snapvault-stream v0.1.0"
}
