//! Persistence: the region image codec and the zstd-compressed region store.
//!
//! # Invariants
//! - A region image always covers all 1024 slots, in slot index order.
//! - A region file is replaced atomically; a failed write never leaves a
//!   partial file in place of a good one.
//! - A missing region file means an empty region, not an error.

mod codec;
mod store;

pub use codec::{MAX_PAYLOAD_LEN, RegionEncoder, decode_region, encode_region};
pub use store::{
    DEFAULT_COMPRESSION_LEVEL, DEFAULT_SNAPSHOT_DIR, RegionFileInfo, RegionStore, StoreError,
};

pub fn crate_info() -> &'static str {
    "snapvault-persist v0.1.0"
}
