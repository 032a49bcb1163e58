//! Worker thread lifecycle
//!
//! Each pipeline activity (preview, still capture, autofocus) runs on its own
//! OS thread described by a [`Worker`]. The controller owns the `enabled`
//! flag; the thread itself moves the phase to running on entry and back to
//! idle on exit, so a stop request is confirmed by waiting on a condition
//! variable instead of sleeping and re-checking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};

use crate::error::{CameraError, Result};

/// How long a stop request waits for the thread to acknowledge.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Locks `mutex`, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Running,
}

pub struct Worker {
    name: &'static str,
    enabled: AtomicBool,
    phase: Mutex<Phase>,
    changed: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            enabled: AtomicBool::new(false),
            phase: Mutex::new(Phase::Idle),
            changed: Condvar::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// True from launch until the thread has exited.
    pub fn is_busy(&self) -> bool {
        *lock(&self.phase) != Phase::Idle
    }

    /// Spawns the thread running `body`. Fails with `Busy` while a previous
    /// run is still in flight.
    pub fn launch<F>(self: &Arc<Self>, body: F) -> Result<()>
    where
        F: FnOnce(&Worker) + Send + 'static,
    {
        {
            let mut phase = lock(&self.phase);
            if *phase != Phase::Idle {
                return Err(CameraError::Busy(format!("{} thread already running", self.name)));
            }
            *phase = Phase::Starting;
            self.enabled.store(true, Ordering::SeqCst);
        }

        // reap the previous run, which has already reached idle
        if let Some(previous) = lock(&self.handle).take() {
            let _ = previous.join();
        }

        let worker = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("camera-{}", self.name))
            .spawn(move || {
                let _running = RunningGuard::enter(&worker);
                body(&worker);
            });

        match spawned {
            Ok(handle) => {
                *lock(&self.handle) = Some(handle);
                Ok(())
            }
            Err(e) => {
                let mut phase = lock(&self.phase);
                self.enabled.store(false, Ordering::SeqCst);
                *phase = Phase::Idle;
                self.changed.notify_all();
                Err(CameraError::Io(e))
            }
        }
    }

    /// Clears `enabled` and wakes the thread if it is pausing.
    pub fn request_stop(&self) {
        let _phase = lock(&self.phase);
        self.enabled.store(false, Ordering::SeqCst);
        self.changed.notify_all();
    }

    /// Waits up to `timeout` for the thread to exit. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let phase = lock(&self.phase);
        let (phase, _) = self
            .changed
            .wait_timeout_while(phase, timeout, |p| *p != Phase::Idle)
            .unwrap_or_else(PoisonError::into_inner);
        *phase == Phase::Idle
    }

    /// Requests a stop and waits for it to be confirmed.
    ///
    /// A thread that does not exit within `timeout` is logged and abandoned:
    /// its handle is dropped and the caller continues teardown. Calling this
    /// from the worker thread itself only requests the stop.
    pub fn stop(&self, timeout: Duration) -> bool {
        self.request_stop();

        let on_own_thread = lock(&self.handle)
            .as_ref()
            .is_some_and(|h| h.thread().id() == thread::current().id());
        if on_own_thread {
            debug!("{} stop requested from its own thread", self.name);
            return false;
        }

        if self.wait_idle(timeout) {
            if let Some(handle) = lock(&self.handle).take() {
                let _ = handle.join();
            }
            true
        } else {
            error!(
                "{} thread did not exit within {:?}, abandoning it",
                self.name, timeout
            );
            drop(lock(&self.handle).take());
            false
        }
    }

    /// Sleeps for up to `duration`, returning early when a stop is
    /// requested. Returns whether the worker is still enabled.
    pub fn pause(&self, duration: Duration) -> bool {
        let phase = lock(&self.phase);
        let _ = self
            .changed
            .wait_timeout_while(phase, duration, |_| self.is_enabled())
            .unwrap_or_else(PoisonError::into_inner);
        self.is_enabled()
    }
}

/// Marks the worker running for the lifetime of its thread body.
struct RunningGuard<'a> {
    worker: &'a Worker,
}

impl<'a> RunningGuard<'a> {
    fn enter(worker: &'a Worker) -> Self {
        let mut phase = lock(&worker.phase);
        *phase = Phase::Running;
        worker.changed.notify_all();
        debug!("{} thread running", worker.name);
        Self { worker }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut phase = lock(&self.worker.phase);
        self.worker.enabled.store(false, Ordering::SeqCst);
        *phase = Phase::Idle;
        self.worker.changed.notify_all();
        debug!("{} thread exited", self.worker.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn test_stop_is_confirmed() {
        let worker = Arc::new(Worker::new("test"));
        let (tx, rx) = mpsc::channel();
        worker
            .launch(move |w| {
                tx.send(()).unwrap();
                while w.pause(Duration::from_millis(500)) {}
            })
            .unwrap();

        rx.recv().unwrap();
        assert!(worker.is_busy());
        let started = Instant::now();
        assert!(worker.stop(STOP_TIMEOUT));
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(!worker.is_busy());
        assert!(!worker.is_enabled());
    }

    #[test]
    fn test_launch_while_busy_fails() {
        let worker = Arc::new(Worker::new("busy"));
        worker
            .launch(|w| while w.pause(Duration::from_millis(10)) {})
            .unwrap();
        assert!(matches!(worker.launch(|_| {}), Err(CameraError::Busy(_))));
        assert!(worker.stop(STOP_TIMEOUT));
        worker.launch(|_| {}).unwrap();
        assert!(worker.wait_idle(STOP_TIMEOUT));
    }

    #[test]
    fn test_stuck_thread_is_abandoned() {
        let worker = Arc::new(Worker::new("stuck"));
        let (tx, rx) = mpsc::channel::<()>();
        worker
            .launch(move |_| {
                let _ = rx.recv_timeout(Duration::from_secs(2));
            })
            .unwrap();

        assert!(!worker.stop(Duration::from_millis(20)));
        drop(tx);
        assert!(worker.wait_idle(STOP_TIMEOUT));
    }
}
