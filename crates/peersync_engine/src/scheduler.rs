//! Fixed-delay background workers.

use crate::error::{SyncError, SyncResult};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Shared cancellation flag that wakes sleeping workers.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    /// Creates an uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels and wakes every waiter.
    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock() = true;
        cvar.notify_all();
    }

    /// Returns true once cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleeps for `timeout` or until cancelled. Returns true if cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut cancelled = flag.lock();
        while !*cancelled {
            if cvar.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }
}

/// A bounded set of named periodic workers sharing one [`CancelToken`].
pub struct Scheduler {
    capacity: usize,
    token: CancelToken,
    workers: Vec<(String, JoinHandle<()>)>,
}

impl Scheduler {
    /// Creates a scheduler running at most `capacity` workers.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            token: CancelToken::new(),
            workers: Vec::new(),
        }
    }

    /// The token cancelled by [`Scheduler::cancel`].
    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Names of the running workers.
    pub fn worker_names(&self) -> Vec<&str> {
        self.workers.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Runs `task` after `initial_delay`, then again `period` after each run finishes.
    pub fn schedule_fixed_delay<F>(
        &mut self,
        name: &str,
        initial_delay: Duration,
        period: Duration,
        mut task: F,
    ) -> SyncResult<()>
    where
        F: FnMut(&CancelToken) + Send + 'static,
    {
        if self.workers.len() >= self.capacity {
            return Err(SyncError::Configuration(format!(
                "scheduler is full ({} workers)",
                self.capacity
            )));
        }

        let token = self.token.clone();
        let handle = thread::Builder::new()
            .name(format!("peersync-{name}"))
            .spawn(move || {
                let mut delay = initial_delay;
                while !token.wait(delay) {
                    task(&token);
                    delay = period;
                }
            })?;
        self.workers.push((name.to_string(), handle));
        Ok(())
    }

    /// Cancels every worker without waiting.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancels and joins every worker, giving up on each after `deadline`.
    ///
    /// Returns the names of workers left running.
    pub fn shutdown(mut self, deadline: Duration) -> Vec<String> {
        self.token.cancel();
        let until = Instant::now() + deadline;
        let mut detached = Vec::new();
        for (name, handle) in std::mem::take(&mut self.workers) {
            if !join_until(handle, until) {
                tracing::warn!(worker = %name, "worker did not stop before the deadline");
                detached.push(name);
            }
        }
        detached
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Joins a thread unless it is still running at `until`. Returns true if joined.
pub(crate) fn join_until(handle: JoinHandle<()>, until: Instant) -> bool {
    while !handle.is_finished() {
        if Instant::now() >= until {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    if handle.join().is_err() {
        tracing::error!("worker thread panicked");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_periodically_until_cancelled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(2);
        let counter = Arc::clone(&runs);
        scheduler
            .schedule_fixed_delay("sync", Duration::ZERO, Duration::from_millis(10), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        thread::sleep(Duration::from_millis(100));
        assert!(scheduler.shutdown(Duration::from_secs(1)).is_empty());
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 2, "ran {seen} times");

        thread::sleep(Duration::from_millis(30));
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn cancel_wakes_long_sleepers() {
        let mut scheduler = Scheduler::new(2);
        scheduler
            .schedule_fixed_delay("sync", Duration::from_secs(3600), Duration::from_secs(3600), |_| {})
            .unwrap();

        let started = Instant::now();
        assert!(scheduler.shutdown(Duration::from_secs(5)).is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn capacity_is_enforced() {
        let mut scheduler = Scheduler::new(2);
        for name in ["sync", "discovery"] {
            scheduler
                .schedule_fixed_delay(name, Duration::from_secs(60), Duration::from_secs(60), |_| {})
                .unwrap();
        }
        assert!(scheduler
            .schedule_fixed_delay("extra", Duration::ZERO, Duration::ZERO, |_| {})
            .is_err());
        assert_eq!(scheduler.worker_names(), vec!["sync", "discovery"]);
    }

    #[test]
    fn stuck_worker_is_detached_after_deadline() {
        let mut scheduler = Scheduler::new(1);
        scheduler
            .schedule_fixed_delay("sync", Duration::ZERO, Duration::from_secs(60), |_| {
                thread::sleep(Duration::from_millis(500));
            })
            .unwrap();
        thread::sleep(Duration::from_millis(50));

        let detached = scheduler.shutdown(Duration::from_millis(20));
        assert_eq!(detached, vec!["sync".to_string()]);
    }

    #[test]
    fn token_wait_reports_cancellation() {
        let token = CancelToken::new();
        assert!(!token.wait(Duration::from_millis(5)));
        token.cancel();
        assert!(token.wait(Duration::from_secs(60)));
        assert!(token.is_cancelled());
    }
}
