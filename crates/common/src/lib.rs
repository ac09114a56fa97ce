//! Shared types for the snapshot cache: cell, region and slot coordinates,
//! and the pair of opaque payloads stored per cell.
//!
//! # Invariants
//! - A region covers exactly 32x32 cells.
//! - `SlotIndex` is a bijection over the 1024 local positions of a region.

mod types;

pub use types::{
    CellCoord, REGION_SHIFT, REGION_SIDE, RegionCoord, SLOTS_PER_REGION, SlotIndex, SlotPayloads,
};

pub fn crate_info() -> &'static str {
    "snapvault-common v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("common"));
    }
}
