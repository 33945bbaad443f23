use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, Builder, JoinHandle},
};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Runs a unit of work over and over on a dedicated thread until told to stop.
///
/// The body should block for a bounded time per call; that bound is the
/// latency of [`LoopThread::stop`]. A stopped loop can be started again.
pub struct LoopThread {
    name: String,
    stop_requested: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LoopThread {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stop_requested: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Spawns the loop thread. Errors returned by `body` are logged and the
    /// loop carries on with the next cycle.
    pub fn start<F>(&self, mut body: F) -> Result<()>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let mut slot = self.thread.lock();
        if let Some(previous) = slot.take() {
            if !previous.is_finished() {
                *slot = Some(previous);
                return Err(Error::AlreadyRunning);
            }
            let _ = previous.join();
        }

        self.stop_requested.store(false, Ordering::SeqCst);
        let stop_requested = Arc::clone(&self.stop_requested);
        let name = self.name.clone();

        let handle = Builder::new().name(self.name.clone()).spawn(move || {
            debug!(thread = %name, "Thread started");
            while !stop_requested.load(Ordering::SeqCst) {
                if let Err(e) = body() {
                    error!(thread = %name, error = %e, "Loop cycle failed");
                }
            }
            debug!(thread = %name, "Thread stopped");
        })?;

        *slot = Some(handle);
        Ok(())
    }

    /// Asks the loop to exit after its current cycle. Does not wait.
    pub fn send_stop_signal(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Signals the loop and waits for its thread to finish.
    pub fn stop(&self) {
        self.send_stop_signal();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            // a loop body asking its own loop to stop must not join itself
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!(thread = %self.name, "Loop thread panicked");
            }
        }
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::AtomicUsize,
        time::{Duration, Instant},
    };

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_loop_runs_body_until_stopped() {
        let looper = LoopThread::new("test-loop");
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        looper
            .start(move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
                Ok(())
            })
            .unwrap();

        assert!(wait_for(|| counter.load(Ordering::SeqCst) >= 3));
        assert!(looper.is_running());

        looper.stop();
        assert!(!looper.is_running());
        let after_stop = counter.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_failing_cycle_does_not_end_loop() {
        let looper = LoopThread::new("failing-loop");
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        looper
            .start(move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
                Err(Error::NotRunning)
            })
            .unwrap();

        assert!(wait_for(|| counter.load(Ordering::SeqCst) >= 3));
        looper.stop();
    }

    #[test]
    fn test_loop_can_restart_after_stop() {
        let looper = LoopThread::new("restart-loop");
        let counter = Arc::new(AtomicUsize::new(0));

        for round in 1..=2 {
            let counter_clone = counter.clone();
            looper
                .start(move || {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(1));
                    Ok(())
                })
                .unwrap();
            assert!(wait_for(|| counter.load(Ordering::SeqCst) >= round * 2));
            looper.stop();
        }
    }

    #[test]
    fn test_double_start_is_rejected() {
        let looper = LoopThread::new("double-start");
        looper
            .start(|| {
                thread::sleep(Duration::from_millis(1));
                Ok(())
            })
            .unwrap();
        assert!(looper.start(|| Ok(())).is_err());
        looper.stop();
    }

    #[test]
    fn test_stop_when_never_started() {
        let looper = LoopThread::new("idle");
        looper.send_stop_signal();
        looper.stop();
        assert!(!looper.is_running());
    }
}
