//! Execution primitives shared by the snapshot cache.
//!
//! - [`KeyedLock`]: striped, reentrant mutual exclusion keyed by an integer.
//! - [`TaskScheduler`]: bounded FIFO worker pool handing out [`Task`] futures.
//! - [`SingleFlight`]: per-key ordering of scheduled work.
//! - [`Periodic`]: a dedicated thread running a budgeted pass on an interval.

mod flight;
mod lock;
mod periodic;
mod scheduler;
mod task;

pub use flight::SingleFlight;
pub use lock::{DEFAULT_STRIPES, KeyedLock, KeyedLockGuard};
pub use periodic::Periodic;
pub use scheduler::{SchedulerConfig, TaskScheduler};
pub use task::{Completer, Task, TaskError, pending};

pub fn crate_info() -> &'static str {
    "snapvault-exec v0.1.0"
}
