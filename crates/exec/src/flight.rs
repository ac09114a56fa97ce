use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use crate::scheduler::TaskScheduler;
use crate::task::{Task, TaskError};

/// Completed entries are pruned once the map grows past this size.
const PRUNE_THRESHOLD: usize = 256;

/// Per-key ordering of scheduled work.
///
/// Each submission for a key first waits for the previous submission for the
/// same key to finish, then runs. Work for one key therefore never overlaps
/// and executes in submission order. The wait happens on the worker: the
/// scheduler queue is FIFO, so by the time a job starts its predecessor has
/// already been dequeued and cannot be waiting on it.
pub struct SingleFlight<K, T> {
    latest: Mutex<HashMap<K, Task<T>>>,
}

impl<K, T> SingleFlight<K, T>
where
    K: Copy + Eq + Hash + Debug + Send + 'static,
    T: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            latest: Mutex::new(HashMap::new()),
        }
    }

    /// Submits `job` for `key` behind any earlier submission for that key.
    pub fn submit<F>(&self, scheduler: &TaskScheduler, key: K, job: F) -> Result<Task<T>, TaskError>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let mut latest = self.latest.lock();
        let prior = latest.get(&key).cloned();
        let task = scheduler.submit_with(move || {
            if let Some(prior) = prior {
                if let Err(e) = prior.wait_finished() {
                    tracing::warn!(?key, error = %e, "previous operation for key did not complete");
                }
            }
            job()
        })?;
        latest.insert(key, task.clone());
        if latest.len() > PRUNE_THRESHOLD {
            latest.retain(|_, t| !t.is_finished());
        }
        Ok(task)
    }

    /// Number of keys with work that has not finished yet.
    pub fn in_flight(&self) -> usize {
        self.latest
            .lock()
            .values()
            .filter(|t| !t.is_finished())
            .count()
    }

    /// Blocks until every submission made so far has finished.
    pub fn drain(&self) {
        let tasks: Vec<Task<T>> = self.latest.lock().values().cloned().collect();
        for task in tasks {
            let _ = task.wait_finished();
        }
        self.latest.lock().retain(|_, t| !t.is_finished());
    }
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Copy + Eq + Hash + Debug + Send + 'static,
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn same_key_runs_in_submission_order() {
        let scheduler = TaskScheduler::with_workers(4).unwrap();
        let flight = SingleFlight::<u32, ()>::new();
        let order = Arc::new(PlMutex::new(Vec::new()));

        let tasks: Vec<_> = (0..20u64)
            .map(|i| {
                let order = order.clone();
                flight
                    .submit(&scheduler, 1, move || {
                        // Earlier jobs sleep longer so any overlap would reorder.
                        thread::sleep(Duration::from_millis(20 - i));
                        order.lock().push(i);
                    })
                    .unwrap()
            })
            .collect();
        for t in tasks {
            t.wait().unwrap();
        }
        assert_eq!(*order.lock(), (0..20u64).collect::<Vec<_>>());
    }

    #[test]
    fn single_worker_does_not_deadlock() {
        let scheduler = TaskScheduler::with_workers(1).unwrap();
        let flight = SingleFlight::<u32, u32>::new();
        let tasks: Vec<_> = (0..5)
            .map(|i| flight.submit(&scheduler, 9, move || i).unwrap())
            .collect();
        let results: Vec<_> = tasks.iter().map(|t| t.wait().unwrap()).collect();
        assert_eq!(results, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn failed_predecessor_does_not_block_successor() {
        let scheduler = TaskScheduler::with_workers(2).unwrap();
        let flight = SingleFlight::<u32, u8>::new();
        let bad = flight
            .submit(&scheduler, 3, || -> u8 { panic!("adapter exploded") })
            .unwrap();
        let good = flight.submit(&scheduler, 3, || 7).unwrap();
        assert!(bad.wait().is_err());
        assert_eq!(good.wait(), Ok(7));
    }

    #[test]
    fn drain_waits_for_all_keys() {
        let scheduler = TaskScheduler::with_workers(2).unwrap();
        let flight = SingleFlight::<u32, ()>::new();
        for key in 0..4 {
            flight
                .submit(&scheduler, key, || thread::sleep(Duration::from_millis(10)))
                .unwrap();
        }
        flight.drain();
        assert_eq!(flight.in_flight(), 0);
    }

    #[test]
    fn rejected_submission_leaves_map_untouched() {
        let scheduler = TaskScheduler::with_workers(1).unwrap();
        scheduler.shutdown();
        let flight = SingleFlight::<u32, ()>::new();
        assert_eq!(
            flight.submit(&scheduler, 1, || {}).unwrap_err(),
            TaskError::Rejected
        );
        assert_eq!(flight.in_flight(), 0);
    }
}
