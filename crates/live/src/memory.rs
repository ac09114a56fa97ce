use parking_lot::Mutex;
use snapvault_common::CellCoord;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crate::adapter::{LiveError, LiveWorld};

/// Live state of one cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellState {
    pub generator: Vec<u8>,
    pub environment: Vec<u8>,
}

/// A record of adapter activity, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    TicketAcquired { cell: CellCoord },
    TicketReleased { cell: CellCoord },
    GeneratorRead { cell: CellCoord },
    GeneratorInstalled { cell: CellCoord },
    EnvironmentRead { cell: CellCoord },
    EnvironmentPasted { cell: CellCoord },
}

/// In-memory live world with failure injection and an activity log.
///
/// Uses a BTreeMap so iteration over cells is deterministic.
#[derive(Default)]
pub struct MemoryWorld {
    cells: Mutex<BTreeMap<CellCoord, CellState>>,
    tickets: Mutex<HashMap<CellCoord, usize>>,
    events: Mutex<Vec<LiveEvent>>,
    overlapping_tickets: AtomicU64,
    fail_generator: AtomicBool,
    fail_environment: AtomicBool,
    fail_tickets: AtomicBool,
    generator_unsupported: AtomicBool,
    operation_delay: Mutex<Duration>,
}

impl MemoryWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the live state of `cell`.
    pub fn set_cell(&self, cell: CellCoord, generator: &[u8], environment: &[u8]) {
        self.cells.lock().insert(
            cell,
            CellState {
                generator: generator.to_vec(),
                environment: environment.to_vec(),
            },
        );
    }

    pub fn cell(&self, cell: CellCoord) -> Option<CellState> {
        self.cells.lock().get(&cell).cloned()
    }

    /// Removes the live state of `cell`, returning what was there.
    pub fn clear_cell(&self, cell: CellCoord) -> Option<CellState> {
        self.cells.lock().remove(&cell)
    }

    pub fn fail_generator(&self, fail: bool) {
        self.fail_generator.store(fail, Ordering::SeqCst);
    }

    pub fn fail_environment(&self, fail: bool) {
        self.fail_environment.store(fail, Ordering::SeqCst);
    }

    pub fn fail_tickets(&self, fail: bool) {
        self.fail_tickets.store(fail, Ordering::SeqCst);
    }

    /// Emulates a world whose generator cannot be snapshotted.
    pub fn set_generator_unsupported(&self, unsupported: bool) {
        self.generator_unsupported.store(unsupported, Ordering::SeqCst);
    }

    /// Sleeps inside every payload operation, widening race windows.
    pub fn set_operation_delay(&self, delay: Duration) {
        *self.operation_delay.lock() = delay;
    }

    /// Snapshot of the activity log.
    pub fn events(&self) -> Vec<LiveEvent> {
        self.events.lock().clone()
    }

    pub fn drain_events(&self) -> Vec<LiveEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Number of times a ticket was acquired for a cell that already held one.
    pub fn overlapping_tickets(&self) -> u64 {
        self.overlapping_tickets.load(Ordering::SeqCst)
    }

    fn record(&self, event: LiveEvent) {
        self.events.lock().push(event);
    }

    fn delay(&self) {
        let delay = *self.operation_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    fn check_generator(&self, cell: CellCoord) -> Result<(), LiveError> {
        if self.generator_unsupported.load(Ordering::SeqCst) {
            return Err(LiveError::Unsupported(
                "world has no snapshot-capable generator".into(),
            ));
        }
        if self.fail_generator.load(Ordering::SeqCst) {
            return Err(LiveError::Rejected {
                cell,
                reason: "injected generator failure".into(),
            });
        }
        Ok(())
    }

    fn check_environment(&self, cell: CellCoord) -> Result<(), LiveError> {
        if self.fail_environment.load(Ordering::SeqCst) {
            return Err(LiveError::Rejected {
                cell,
                reason: "injected environment failure".into(),
            });
        }
        Ok(())
    }
}

impl LiveWorld for MemoryWorld {
    fn acquire_ticket(&self, cell: CellCoord) -> Result<(), LiveError> {
        if self.fail_tickets.load(Ordering::SeqCst) {
            return Err(LiveError::Rejected {
                cell,
                reason: "injected ticket failure".into(),
            });
        }
        let mut tickets = self.tickets.lock();
        let held = tickets.entry(cell).or_insert(0);
        if *held > 0 {
            self.overlapping_tickets.fetch_add(1, Ordering::SeqCst);
        }
        *held += 1;
        self.record(LiveEvent::TicketAcquired { cell });
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
        self.record(LiveEvent::TicketReleased { cell });
    }

    fn read_generator_state(&self, cell: CellCoord) -> Result<Vec<u8>, LiveError> {
        self.check_generator(cell)?;
        self.delay();
        let state = self
            .cells
            .lock()
            .get(&cell)
            .map(|s| s.generator.clone())
            .ok_or(LiveError::Missing { cell })?;
        self.record(LiveEvent::GeneratorRead { cell });
        Ok(state)
    }

    fn install_generator_state(&self, cell: CellCoord, state: &[u8]) -> Result<(), LiveError> {
        self.check_generator(cell)?;
        self.delay();
        self.cells.lock().entry(cell).or_default().generator = state.to_vec();
        self.record(LiveEvent::GeneratorInstalled { cell });
        Ok(())
    }

    fn read_built_environment(&self, cell: CellCoord) -> Result<Vec<u8>, LiveError> {
        self.check_environment(cell)?;
        self.delay();
        let environment = self
            .cells
            .lock()
            .get(&cell)
            .map(|s| s.environment.clone())
            .ok_or(LiveError::Missing { cell })?;
        self.record(LiveEvent::EnvironmentRead { cell });
        Ok(environment)
    }

    fn paste_built_environment(
        &self,
        cell: CellCoord,
        environment: &[u8],
    ) -> Result<(), LiveError> {
        self.check_environment(cell)?;
        self.delay();
        self.cells.lock().entry(cell).or_default().environment = environment.to_vec();
        self.record(LiveEvent::EnvironmentPasted { cell });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::CellTicket;

    #[test]
    fn read_back_what_was_set() {
        let world = MemoryWorld::new();
        let cell = CellCoord::new(1, 2);
        world.set_cell(cell, b"gen", b"env");
        assert_eq!(world.read_generator_state(cell).unwrap(), b"gen");
        assert_eq!(world.read_built_environment(cell).unwrap(), b"env");
    }

    #[test]
    fn missing_cell_is_an_error() {
        let world = MemoryWorld::new();
        let err = world.read_generator_state(CellCoord::new(0, 0)).unwrap_err();
        assert!(matches!(err, LiveError::Missing { .. }));
    }

    #[test]
    fn install_and_paste_create_state() {
        let world = MemoryWorld::new();
        let cell = CellCoord::new(-4, 9);
        world.install_generator_state(cell, b"g").unwrap();
        world.paste_built_environment(cell, b"e").unwrap();
        assert_eq!(
            world.cell(cell),
            Some(CellState {
                generator: b"g".to_vec(),
                environment: b"e".to_vec(),
            })
        );
    }

    #[test]
    fn injected_failures_are_independent() {
        let world = MemoryWorld::new();
        let cell = CellCoord::new(0, 0);
        world.set_cell(cell, b"g", b"e");
        world.fail_generator(true);
        assert!(world.read_generator_state(cell).is_err());
        assert!(world.read_built_environment(cell).is_ok());
        world.fail_generator(false);
        world.fail_environment(true);
        assert!(world.read_generator_state(cell).is_ok());
        assert!(world.read_built_environment(cell).is_err());
    }

    #[test]
    fn unsupported_generator_reports_unsupported() {
        let world = MemoryWorld::new();
        world.set_generator_unsupported(true);
        let err = world
            .install_generator_state(CellCoord::new(0, 0), b"x")
            .unwrap_err();
        assert!(matches!(err, LiveError::Unsupported(_)));
    }

    #[test]
    fn ticket_guard_releases_on_drop() {
        let world = MemoryWorld::new();
        let cell = CellCoord::new(3, 3);
        {
            let ticket = CellTicket::acquire(&world, cell).unwrap();
            assert_eq!(ticket.cell(), cell);
        }
        assert_eq!(
            world.events(),
            vec![
                LiveEvent::TicketAcquired { cell },
                LiveEvent::TicketReleased { cell },
            ]
        );
        assert_eq!(world.overlapping_tickets(), 0);
    }

    #[test]
    fn nested_tickets_are_counted_as_overlap() {
        let world = MemoryWorld::new();
        let cell = CellCoord::new(0, 1);
        let _a = CellTicket::acquire(&world, cell).unwrap();
        let _b = CellTicket::acquire(&world, cell).unwrap();
        assert_eq!(world.overlapping_tickets(), 1);
    }

    #[test]
    fn failed_ticket_is_not_recorded() {
        let world = MemoryWorld::new();
        world.fail_tickets(true);
        assert!(CellTicket::acquire(&world, CellCoord::new(0, 0)).is_err());
        assert!(world.events().is_empty());
    }
}
