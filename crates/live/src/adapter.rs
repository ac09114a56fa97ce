use snapvault_common::CellCoord;

/// Errors reported by a live-world adapter.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("operation not supported by this world: {0}")]
    Unsupported(String),
    #[error("no live state for cell {cell}")]
    Missing { cell: CellCoord },
    #[error("live world refused the operation on cell {cell}: {reason}")]
    Rejected { cell: CellCoord, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Boundary to the running world.
///
/// The cache never looks inside either payload; it only moves bytes between
/// this adapter and its slots. Every call may fail independently.
pub trait LiveWorld: Send + Sync {
    /// Keeps `cell` loaded in the live world until released.
    fn acquire_ticket(&self, cell: CellCoord) -> Result<(), LiveError>;

    fn release_ticket(&self, cell: CellCoord);

    /// Serialized generator state for `cell`.
    fn read_generator_state(&self, cell: CellCoord) -> Result<Vec<u8>, LiveError>;

    fn install_generator_state(&self, cell: CellCoord, state: &[u8]) -> Result<(), LiveError>;

    /// Serialized built environment for `cell`.
    fn read_built_environment(&self, cell: CellCoord) -> Result<Vec<u8>, LiveError>;

    /// Pastes `environment` back at the origin of `cell`.
    fn paste_built_environment(&self, cell: CellCoord, environment: &[u8])
    -> Result<(), LiveError>;
}

/// Scoped hold on a live cell; released on drop.
pub struct CellTicket<'a> {
    world: &'a dyn LiveWorld,
    cell: CellCoord,
}

impl<'a> CellTicket<'a> {
    pub fn acquire(world: &'a dyn LiveWorld, cell: CellCoord) -> Result<Self, LiveError> {
        world.acquire_ticket(cell)?;
        Ok(Self { world, cell })
    }

    pub fn cell(&self) -> CellCoord {
        self.cell
    }
}

impl Drop for CellTicket<'_> {
    fn drop(&mut self) {
        self.world.release_ticket(self.cell);
    }
}
