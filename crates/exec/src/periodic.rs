use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A dedicated thread running a pass every `period`.
///
/// Each pass is budgeted against the period: the thread sleeps only for what
/// is left of the period after the pass, never a negative amount. The loop
/// ends when [`Periodic::stop`] is called, when the handle is dropped, or when
/// a pass returns `false`.
pub struct Periodic {
    name: String,
    stop: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Periodic {
    pub fn spawn<F>(name: &str, period: Duration, mut pass: F) -> std::io::Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let thread_name = name.to_string();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            loop {
                let started = Instant::now();
                if !pass() {
                    tracing::debug!(thread = %thread_name, "periodic pass requested exit");
                    break;
                }
                let remaining = period.saturating_sub(started.elapsed());
                match stop_rx.recv_timeout(remaining) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;
        Ok(Self {
            name: name.to_string(),
            stop: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signals the loop to exit and joins it. Idempotent.
    ///
    /// When called from the loop's own thread the join is skipped.
    pub fn stop(&self) {
        drop(self.stop.lock().take());
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::error!(thread = %self.name, "periodic thread panicked");
        }
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        self.stop();
    }
}
