use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::task::{Task, TaskError, pending};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads. `None` uses the available parallelism.
    pub workers: Option<usize>,
    /// Prefix for worker thread names.
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: None,
            thread_name: "snapvault-worker".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Worker count after applying the default and the floor of one.
    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(|| thread::available_parallelism().map_or(1, |n| n.get()))
            .max(1)
    }
}

/// Live worker count, signalled as workers exit.
struct Liveness {
    running: Mutex<usize>,
    exited: Condvar,
}

/// Bounded pool of worker threads executing submitted jobs in FIFO order.
///
/// Jobs always run on a worker, never on the submitting thread.
pub struct TaskScheduler {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel_queued: Arc<AtomicBool>,
    liveness: Arc<Liveness>,
    worker_count: usize,
}

impl TaskScheduler {
    pub fn new(config: &SchedulerConfig) -> std::io::Result<Self> {
        let worker_count = config.worker_count();
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let liveness = Arc::new(Liveness {
            running: Mutex::new(worker_count),
            exited: Condvar::new(),
        });

        let workers = (0..worker_count)
            .map(|i| {
                let receiver = receiver.clone();
                let liveness = liveness.clone();
                thread::Builder::new()
                    .name(format!("{}-{}", config.thread_name, i + 1))
                    .spawn(move || worker_loop(receiver, liveness))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        tracing::debug!(workers = worker_count, "task scheduler started");
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            cancel_queued: Arc::new(AtomicBool::new(false)),
            liveness,
            worker_count,
        })
    }

    /// A scheduler with exactly `workers` threads (at least one).
    pub fn with_workers(workers: usize) -> std::io::Result<Self> {
        Self::new(&SchedulerConfig {
            workers: Some(workers),
            ..SchedulerConfig::default()
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Submits a job with no result.
    pub fn submit<F>(&self, job: F) -> Result<Task<()>, TaskError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_with(job)
    }

    /// Submits a job whose return value resolves the task.
    pub fn submit_with<T, F>(&self, job: F) -> Result<Task<T>, TaskError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (task, completer) = pending();
        let cancel_queued = self.cancel_queued.clone();
        let wrapped: Job = Box::new(move || {
            if cancel_queued.load(Ordering::Acquire) {
                // Dropping the completer resolves the task as cancelled.
                return;
            }
            let result = catch_unwind(AssertUnwindSafe(job)).map_err(|payload| {
                let message = panic_message(payload.as_ref());
                tracing::error!(%message, "scheduled task panicked");
                TaskError::Panicked(message)
            });
            completer.complete(result);
        });

        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) => tx.send(wrapped).map_err(|_| TaskError::Rejected)?,
            None => return Err(TaskError::Rejected),
        }
        Ok(task)
    }

    /// Stops accepting work. Already queued jobs still run.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_some() {
            tracing::debug!("task scheduler shutting down");
        }
    }

    /// Stops accepting work and cancels queued jobs that have not started.
    pub fn shutdown_now(&self) {
        self.cancel_queued.store(true, Ordering::Release);
        self.shutdown();
    }

    /// Waits for every worker to exit, up to `timeout`.
    ///
    /// Returns `true` when the pool fully terminated. Only meaningful after
    /// [`TaskScheduler::shutdown`] or [`TaskScheduler::shutdown_now`].
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        {
            let mut running = self.liveness.running.lock();
            while *running > 0 {
                if self
                    .liveness
                    .exited
                    .wait_until(&mut running, deadline)
                    .timed_out()
                {
                    if *running > 0 {
                        tracing::warn!(
                            running = *running,
                            "task scheduler did not terminate in time"
                        );
                        return false;
                    }
                    break;
                }
            }
        }

        let current = thread::current().id();
        for handle in self.workers.lock().drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("scheduler worker exited by panic");
            }
        }
        true
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Receiver<Job>, liveness: Arc<Liveness>) {
    while let Ok(job) = receiver.recv() {
        job();
    }
    let mut running = liveness.running.lock();
    *running -= 1;
    liveness.exited.notify_all();
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
