use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::Builder,
};

use parking_lot::{Condvar, Mutex};

use crate::error::Result;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct SharedState {
    in_flight: Mutex<usize>,
    condvar: Condvar,
}

/// Releases a worker slot when dropped, including when the task panics.
struct Slot(Arc<SharedState>);

impl Drop for Slot {
    fn drop(&mut self) {
        let mut in_flight = self.0.in_flight.lock();
        *in_flight -= 1;
        self.0.condvar.notify_all();
    }
}

/// Runs each task on its own short-lived worker thread, with at most
/// `limit` tasks in flight.
///
/// [`ThreadPool::exec`] blocks the submitting thread while the ceiling is
/// reached. Callers use that as backpressure: a dispatch loop stuck in
/// `exec` stops draining its selector.
pub struct ThreadPool {
    limit: Option<usize>,
    state: Arc<SharedState>,
    next_worker: AtomicU64,
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ThreadPool {
    /// `None` lifts the ceiling entirely.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            state: Arc::new(SharedState {
                in_flight: Mutex::new(0),
                condvar: Condvar::new(),
            }),
            next_worker: AtomicU64::new(0),
        }
    }

    pub fn exec<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.exec_boxed(Box::new(task))
    }

    fn exec_boxed(&self, task: Task) -> Result<()> {
        {
            let mut in_flight = self.state.in_flight.lock();
            if let Some(limit) = self.limit {
                while *in_flight >= limit {
                    self.state.condvar.wait(&mut in_flight);
                }
            }
            *in_flight += 1;
        }
        let slot = Slot(Arc::clone(&self.state));

        let id = self.next_worker.fetch_add(1, Ordering::Relaxed);
        Builder::new()
            .name(format!("mill-worker-{id}"))
            .spawn(move || {
                let _slot = slot;
                task();
            })?;
        Ok(())
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn in_flight(&self) -> usize {
        *self.state.in_flight.lock()
    }
}
