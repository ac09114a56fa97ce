use serde::{Deserialize, Serialize};
use std::fmt;

/// log2 of the region side length, in cells.
pub const REGION_SHIFT: u32 = 5;
/// Number of cells along one side of a region.
pub const REGION_SIDE: i32 = 1 << REGION_SHIFT;
/// Number of slots held by one region.
pub const SLOTS_PER_REGION: usize = (REGION_SIDE * REGION_SIDE) as usize;

const LOCAL_MASK: i32 = REGION_SIDE - 1;

/// A grid-cell coordinate in world space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellCoord {
    pub x: i32,
    pub z: i32,
}

impl CellCoord {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// The region this cell belongs to.
    pub fn region(self) -> RegionCoord {
        RegionCoord {
            x: self.x >> REGION_SHIFT,
            z: self.z >> REGION_SHIFT,
        }
    }

    /// The slot this cell occupies inside its region.
    pub fn slot(self) -> SlotIndex {
        SlotIndex::of(self)
    }
}

impl fmt::Display for CellCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.z)
    }
}

/// A region coordinate. Each region covers a 32x32 block of cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionCoord {
    pub x: i32,
    pub z: i32,
}

impl RegionCoord {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// World-space cell at the given slot of this region.
    pub fn cell(self, slot: SlotIndex) -> CellCoord {
        let (lx, lz) = slot.local();
        CellCoord {
            x: (self.x << REGION_SHIFT) + lx,
            z: (self.z << REGION_SHIFT) + lz,
        }
    }
}

impl fmt::Display for RegionCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r({}, {})", self.x, self.z)
    }
}

/// Linear index of a cell inside its region, row-major with rows along z.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotIndex(u16);

impl SlotIndex {
    pub fn of(cell: CellCoord) -> Self {
        let lx = cell.x & LOCAL_MASK;
        let lz = cell.z & LOCAL_MASK;
        Self((lx + lz * REGION_SIDE) as u16)
    }

    /// Returns `None` when `index` is outside `[0, 1024)`.
    pub fn new(index: usize) -> Option<Self> {
        (index < SLOTS_PER_REGION).then_some(Self(index as u16))
    }

    pub fn get(self) -> usize {
        self.0 as usize
    }

    /// Local `(x & 31, z & 31)` pair for this slot.
    pub fn local(self) -> (i32, i32) {
        let i = self.0 as i32;
        (i & LOCAL_MASK, i >> REGION_SHIFT)
    }

    pub fn all() -> impl Iterator<Item = SlotIndex> {
        (0..SLOTS_PER_REGION as u16).map(SlotIndex)
    }
}

/// The two opaque payloads stored for one cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotPayloads {
    /// Generator-state blob.
    pub generator: Option<Vec<u8>>,
    /// Built-environment blob.
    pub environment: Option<Vec<u8>>,
}

impl SlotPayloads {
    pub fn is_empty(&self) -> bool {
        self.generator.is_none() && self.environment.is_none()
    }

    pub fn is_full(&self) -> bool {
        self.generator.is_some() && self.environment.is_some()
    }
}
