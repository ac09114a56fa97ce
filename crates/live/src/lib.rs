//! Live-world boundary: the only way the snapshot cache touches the running
//! world.
//!
//! # Invariants
//! - Payloads are opaque bytes; this crate never interprets them.
//! - A failure reading or applying one payload never affects the other.

mod adapter;
mod directory;
mod memory;

pub use adapter::{CellTicket, LiveError, LiveWorld};
pub use directory::DirectoryWorld;
pub use memory::{CellState, LiveEvent, MemoryWorld};

pub fn crate_info() -> &'static str {
    "snapvault-live v0.1.0"
}
