//! File-backed live world.
//!
//! Layout inside the world directory:
//! ```text
//! live/
//!   <x>_<z>.generator    - generator state of one cell
//!   <x>_<z>.environment  - built environment of one cell
//! ```

use parking_lot::Mutex;
use snapvault_common::CellCoord;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::adapter::{LiveError, LiveWorld};

const LIVE_DIR: &str = "live";
const GENERATOR_EXT: &str = "generator";
const ENVIRONMENT_EXT: &str = "environment";

/// A live world whose cells are plain files under a directory.
pub struct DirectoryWorld {
    root: PathBuf,
    tickets: Mutex<HashMap<CellCoord, usize>>,
}

impl DirectoryWorld {
    /// Binds to an existing world directory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, LiveError> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(LiveError::Io(std::io::Error::new(
                ErrorKind::NotFound,
                format!("world directory {} does not exist", root.display()),
            )));
        }
        Ok(Self {
            root,
            tickets: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cells currently held by a ticket.
    pub fn held_tickets(&self) -> usize {
        self.tickets.lock().len()
    }

    fn cell_path(&self, cell: CellCoord, ext: &str) -> PathBuf {
        self.root
            .join(LIVE_DIR)
            .join(format!("{}_{}.{}", cell.x, cell.z, ext))
    }

    fn read(&self, cell: CellCoord, ext: &str) -> Result<Vec<u8>, LiveError> {
        match std::fs::read(self.cell_path(cell, ext)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(LiveError::Missing { cell }),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, cell: CellCoord, ext: &str, data: &[u8]) -> Result<(), LiveError> {
        std::fs::create_dir_all(self.root.join(LIVE_DIR))?;
        std::fs::write(self.cell_path(cell, ext), data)?;
        Ok(())
    }
}

impl LiveWorld for DirectoryWorld {
    fn acquire_ticket(&self, cell: CellCoord) -> Result<(), LiveError> {
        *self.tickets.lock().entry(cell).or_insert(0) += 1;
        tracing::trace!(?cell, "cell ticket acquired");
        Ok(())
    }

    fn release_ticket(&self, cell: CellCoord) {
        let mut tickets = self.tickets.lock();
        if let Some(held) = tickets.get_mut(&cell) {
            *held -= 1;
            if *held == 0 {
                tickets.remove(&cell);
            }
        }
        tracing::trace!(?cell, "cell ticket released");
    }

    fn read_generator_state(&self, cell: CellCoord) -> Result<Vec<u8>, LiveError> {
        self.read(cell, GENERATOR_EXT)
    }

    fn install_generator_state(&self, cell: CellCoord, state: &[u8]) -> Result<(), LiveError> {
        self.write(cell, GENERATOR_EXT, state)
    }

    fn read_built_environment(&self, cell: CellCoord) -> Result<Vec<u8>, LiveError> {
        self.read(cell, ENVIRONMENT_EXT)
    }

    fn paste_built_environment(
        &self,
        cell: CellCoord,
        environment: &[u8],
    ) -> Result<(), LiveError> {
        self.write(cell, ENVIRONMENT_EXT, environment)
    }
}
