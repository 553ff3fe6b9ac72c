//! Per-processor task accounting

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Point-in-time view of a [`TaskCounter`].
///
/// The fields are read one atomic at a time, so a snapshot taken while tasks
/// are in flight is approximate; it is exact once the processor is idle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounterSnapshot {
    /// Total task contexts created on the processor
    pub created: u64,
    /// Total task contexts destroyed
    pub destroyed: u64,
    /// Task contexts currently alive (`created - destroyed`)
    pub alive: u64,
    /// Timed-out dequeue attempts by worker threads
    pub switch_slow: u64,
    /// Overload-handler invocations
    pub overloaded: u64,
    /// Tasks cancelled because of overload
    pub cancelled_overload: u64,
}

/// Tracks task context lifetimes and overload events for one task processor.
///
/// The counter is the accounting leaf of the scheduler: contexts report their
/// creation and destruction here, workers report slow dequeues, and the
/// overload handler reports cancellations. `created - destroyed` is the number
/// of contexts currently alive, which must drain to zero before a processor
/// finishes shutting down.
pub struct TaskCounter {
    created: AtomicU64,
    destroyed: AtomicU64,
    switch_slow: AtomicU64,
    overloaded: AtomicU64,
    cancelled_overload: AtomicU64,
}

impl TaskCounter {
    /// Create a counter with all accounts at zero
    pub fn new() -> Self {
        Self {
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            switch_slow: AtomicU64::new(0),
            overloaded: AtomicU64::new(0),
            cancelled_overload: AtomicU64::new(0),
        }
    }

    /// Account one task context creation
    pub fn account_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    /// Account one task context destruction
    pub fn account_destroyed(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Account one timed-out dequeue on a worker thread
    pub fn account_switch_slow(&self) {
        self.switch_slow.fetch_add(1, Ordering::Relaxed);
    }

    /// Account one overload-handler invocation
    pub fn account_overload(&self) {
        self.overloaded.fetch_add(1, Ordering::Relaxed);
    }

    /// Account one cancellation caused by overload
    pub fn account_cancel_overload(&self) {
        self.cancelled_overload.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of task contexts currently alive
    pub fn value(&self) -> u64 {
        // destroyed first: a context accounts destruction after creation, so
        // this read order never observes destroyed > created
        let destroyed = self.destroyed.load(Ordering::Acquire);
        let created = self.created.load(Ordering::Acquire);
        created.saturating_sub(destroyed)
    }

    /// Block until no task contexts remain alive, up to `timeout`.
    ///
    /// Returns whether the counter reached zero.
    pub fn wait_for_exhaustion(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.value() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_micros(500));
        }
        true
    }

    /// Take a point-in-time snapshot of all accounts
    pub fn snapshot(&self) -> TaskCounterSnapshot {
        let destroyed = self.destroyed.load(Ordering::Acquire);
        let created = self.created.load(Ordering::Acquire);
        TaskCounterSnapshot {
            created,
            destroyed,
            alive: created.saturating_sub(destroyed),
            switch_slow: self.switch_slow.load(Ordering::Relaxed),
            overloaded: self.overloaded.load(Ordering::Relaxed),
            cancelled_overload: self.cancelled_overload.load(Ordering::Relaxed),
        }
    }
}

impl Default for TaskCounter {
    fn default() -> Self {
        Self::new()
    }
}
