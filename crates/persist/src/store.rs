//! File-backed region storage.
//!
//! Layout inside the world directory:
//! ```text
//! snapshots/
//!   <rx>_<rz>.region.zst      - zstd-compressed region image
//!   <rx>_<rz>.region.zst.tmp  - in-progress write, renamed into place on success
//! ```

use serde::Serialize;
use snapvault_common::RegionCoord;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Directory under the world directory holding region files.
pub const DEFAULT_SNAPSHOT_DIR: &str = "snapshots";
/// zstd level used when none is configured.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

const REGION_SUFFIX: &str = ".region.zst";
const TMP_SUFFIX: &str = ".tmp";

/// Errors from region persistence.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid presence flag {value} in slot {slot}")]
    InvalidFlag { slot: usize, value: u8 },
    #[error("payload of {len} bytes in slot {slot} exceeds the size limit")]
    PayloadTooLarge { slot: usize, len: usize },
    #[error("region image truncated in slot {slot}")]
    Truncated { slot: usize },
    #[error("unexpected data after the last slot")]
    TrailingBytes,
    #[error("region image must have {expected} slots, got {actual}")]
    SlotCount { expected: usize, actual: usize },
}

/// A stored region file, as reported by [`RegionStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionFileInfo {
    pub coord: RegionCoord,
    pub compressed_bytes: u64,
}

/// Region files for one world.
#[derive(Debug, Clone)]
pub struct RegionStore {
    root: PathBuf,
    compression_level: i32,
}

impl RegionStore {
    /// Store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl AsRef<Path>, compression_level: i32) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            compression_level,
        }
    }

    /// Store in the default snapshot directory of `world_dir`.
    pub fn for_world(world_dir: impl AsRef<Path>) -> Self {
        Self::new(
            world_dir.as_ref().join(DEFAULT_SNAPSHOT_DIR),
            DEFAULT_COMPRESSION_LEVEL,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn region_path(&self, coord: RegionCoord) -> PathBuf {
        self.root
            .join(format!("{}_{}{}", coord.x, coord.z, REGION_SUFFIX))
    }

    pub fn exists(&self, coord: RegionCoord) -> bool {
        self.region_path(coord).is_file()
    }

    /// Reads and decompresses the image for `coord`. `None` if never stored.
    pub fn load(&self, coord: RegionCoord) -> Result<Option<Vec<u8>>, StoreError> {
        let file = match File::open(self.region_path(coord)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut decoder = zstd::Decoder::new(BufReader::new(file))?;
        let mut image = Vec::new();
        decoder.read_to_end(&mut image)?;
        tracing::trace!(?coord, bytes = image.len(), "region image loaded");
        Ok(Some(image))
    }

    /// Compresses and writes the image for `coord`.
    ///
    /// The file is written under a temporary name and renamed over the old
    /// one only once complete, so a failed write never leaves a partial file.
    pub fn save(&self, coord: RegionCoord, image: &[u8]) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).map_err(|source| StoreError::CreateDir {
            path: self.root.clone(),
            source,
        })?;
        let path = self.region_path(coord);
        let tmp = tmp_path(&path);

        let result = self.write_compressed(&tmp, image);
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        fs::rename(&tmp, &path)?;
        tracing::trace!(?coord, bytes = image.len(), "region image saved");
        Ok(())
    }

    fn write_compressed(&self, path: &Path, image: &[u8]) -> Result<(), StoreError> {
        let file = File::create(path)?;
        let mut encoder = zstd::Encoder::new(BufWriter::new(file), self.compression_level)?;
        encoder.write_all(image)?;
        let writer = encoder.finish()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }

    /// Deletes the stored image for `coord`. Returns whether a file existed.
    pub fn remove(&self, coord: RegionCoord) -> Result<bool, StoreError> {
        match fs::remove_file(self.region_path(coord)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// All stored regions, sorted by coordinate.
    pub fn list(&self) -> Result<Vec<RegionFileInfo>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut regions = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(coord) = name.to_str().and_then(parse_region_name) else {
                continue;
            };
            regions.push(RegionFileInfo {
                coord,
                compressed_bytes: entry.metadata()?.len(),
            });
        }
        regions.sort_by_key(|r| r.coord);
        Ok(regions)
    }

    /// Recursively deletes the store directory.
    ///
    /// Symbolic links are unlinked, never followed. A missing directory is
    /// already wiped.
    pub fn wipe(&self) -> Result<(), StoreError> {
        match fs::symlink_metadata(&self.root) {
            Ok(_) => delete_tree(&self.root)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(root = %self.root.display(), "region store wiped");
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

fn parse_region_name(name: &str) -> Option<RegionCoord> {
    let stem = name.strip_suffix(REGION_SUFFIX)?;
    let (x, z) = stem.split_once('_')?;
    Some(RegionCoord::new(x.parse().ok()?, z.parse().ok()?))
}

fn delete_tree(path: &Path) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        for entry in fs::read_dir(path)? {
            delete_tree(&entry?.path())?;
        }
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    }
}
