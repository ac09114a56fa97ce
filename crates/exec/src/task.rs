use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Errors surfaced through a [`Task`] or by submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task was cancelled before it ran")]
    Cancelled,
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("scheduler is shut down and rejected the task")]
    Rejected,
}

enum TaskState<T> {
    Pending,
    Done(Result<T, TaskError>),
}

struct Shared<T> {
    state: Mutex<TaskState<T>>,
    ready: Condvar,
}

/// Handle to the eventual result of a submitted unit of work.
///
/// Handles are cheap to clone; every clone observes the same result.
pub struct Task<T> {
    shared: Arc<Shared<T>>,
}

/// The completing half of a [`Task`].
///
/// Dropping it without calling [`Completer::complete`] resolves the task as
/// [`TaskError::Cancelled`].
pub struct Completer<T> {
    shared: Option<Arc<Shared<T>>>,
}

/// Creates a pending task and the half that completes it.
pub fn pending<T>() -> (Task<T>, Completer<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(TaskState::Pending),
        ready: Condvar::new(),
    });
    (
        Task {
            shared: shared.clone(),
        },
        Completer {
            shared: Some(shared),
        },
    )
}

impl<T> Task<T> {
    pub fn is_finished(&self) -> bool {
        matches!(*self.shared.state.lock(), TaskState::Done(_))
    }

    /// Blocks until the task resolves, discarding its value.
    pub fn wait_finished(&self) -> Result<(), TaskError> {
        let mut state = self.shared.state.lock();
        loop {
            match &*state {
                TaskState::Pending => self.shared.ready.wait(&mut state),
                TaskState::Done(Ok(_)) => return Ok(()),
                TaskState::Done(Err(e)) => return Err(e.clone()),
            }
        }
    }

    /// Whether two handles refer to the same submission.
    pub fn same_as(&self, other: &Task<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T: Clone> Task<T> {
    /// Blocks the calling thread until the task resolves.
    pub fn wait(&self) -> Result<T, TaskError> {
        let mut state = self.shared.state.lock();
        loop {
            match &*state {
                TaskState::Pending => self.shared.ready.wait(&mut state),
                TaskState::Done(result) => return result.clone(),
            }
        }
    }

    /// Like [`Task::wait`] but gives up after `timeout`, returning `None`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, TaskError>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            match &*state {
                TaskState::Done(result) => return Some(result.clone()),
                TaskState::Pending => {
                    if self.shared.ready.wait_until(&mut state, deadline).timed_out() {
                        return match &*state {
                            TaskState::Done(result) => Some(result.clone()),
                            TaskState::Pending => None,
                        };
                    }
                }
            }
        }
    }
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl<T> Completer<T> {
    pub fn complete(mut self, result: Result<T, TaskError>) {
        if let Some(shared) = self.shared.take() {
            resolve(&shared, result);
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            resolve(&shared, Err(TaskError::Cancelled));
        }
    }
}

fn resolve<T>(shared: &Shared<T>, result: Result<T, TaskError>) {
    let mut state = shared.state.lock();
    if matches!(*state, TaskState::Pending) {
        *state = TaskState::Done(result);
        shared.ready.notify_all();
    }
}
