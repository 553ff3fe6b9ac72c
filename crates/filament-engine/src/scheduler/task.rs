//! Task context: the per-task state the scheduler core operates on
//!
//! A [`TaskContext`] is the in-memory representation of one cooperative task.
//! The coroutine machinery itself is opaque to the scheduler and reduced here
//! to a pluggable step closure; everything else is the contract surface the
//! processor and the wait lists depend on: lifecycle flags, the sampled
//! queue-wait timepoint, cooperative cancellation state, and completion
//! signalling.
//!
//! Contexts are shared across threads as `Arc<TaskContext>`: the user handle,
//! the task queue, the worker currently stepping the task, and possibly the
//! processor's detached set all hold strong references. The reference the
//! queue carries is the one handed off by `schedule`; dequeue adopts it
//! without an extra refcount bump.

use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;

use super::counter::TaskCounter;
use super::processor::{ProcessorShared, TaskProcessor};

/// Unique identifier for a task context
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Why cancellation was requested on a task.
///
/// Cancellation is cooperative: the reason is a sticky flag the task observes
/// at its next checkpoint, never a forced unwind. The first reason to arrive
/// wins, except that `Shutdown` replaces an already-stored `Overload`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum CancellationReason {
    /// Cancelled by user code
    User = 1,
    /// Cancelled because the processor queue crossed an overload threshold
    Overload = 2,
    /// Cancelled because the owning processor is shutting down
    Shutdown = 3,
}

impl CancellationReason {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::User),
            2 => Some(Self::Overload),
            3 => Some(Self::Shutdown),
            _ => None,
        }
    }
}

/// What woke a parked task
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum WakeupSource {
    /// Woken by a wait list attached to a synchronization primitive
    WaitList = 1,
    /// Woken by a deadline timer
    DeadlineTimer = 2,
    /// Woken so the task can observe a cancellation request
    Cancellation = 3,
}

impl WakeupSource {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::WaitList),
            2 => Some(Self::DeadlineTimer),
            3 => Some(Self::Cancellation),
            _ => None,
        }
    }
}

/// Result of one scheduling step
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The task ran its terminal step; it will never be stepped again
    Finished,
    /// The task returned without completing: it parked itself on a wait list
    /// or re-scheduled itself, and another step will follow
    Suspended,
}

/// Error produced by a failing scheduling step.
///
/// Step failures are observed and logged by the worker that ran the step;
/// they never propagate to the worker thread's top level.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// The step reported an error
    #[error("task step failed: {0}")]
    Failed(String),
    /// The step panicked; the panic was caught at the step boundary
    #[error("task step panicked")]
    Panicked,
}

type StepFn = Box<dyn FnMut(&Arc<TaskContext>) -> Result<StepOutcome, StepError> + Send>;

/// Anchor for storing steady-clock timepoints in an atomic.
///
/// Timepoints are kept as nanoseconds since this anchor so the field stays a
/// plain `AtomicU64`; zero is the "no timestamp sampled" sentinel. Processor
/// construction pins the anchor, so every stamped timepoint lies after it.
pub(crate) fn clock_anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// One cooperative task, as seen by the scheduler core.
///
/// The context is runnable iff it is enqueued exactly once on exactly one
/// processor's queue, currently executing on a worker, or parked on a wait
/// list. [`TaskContext::do_step`] serializes execution so no two steps of the
/// same task ever run concurrently.
pub struct TaskContext {
    // -- Immutable (set at creation, never changes) --
    /// Unique identifier, used in logs
    id: TaskId,

    /// Critical tasks are exempt from overload cancellation
    critical: bool,

    /// Self-handle so `&self` methods can hand out owned references
    me: Weak<TaskContext>,

    /// Processor this task re-schedules onto when woken
    processor: Weak<ProcessorShared>,

    /// Lifetime accounting; held directly so destruction is accounted even if
    /// the context outlives its processor
    counter: Arc<TaskCounter>,

    // -- Atomics (lock-free) --
    /// Set by the terminal step; no further steps occur once observed true
    finished: AtomicBool,

    /// Sticky flag set by `TaskProcessor::adopt`; never cleared
    detached: AtomicBool,

    /// Requested cancellation reason (0 = not requested)
    cancellation: AtomicU8,

    /// Nanoseconds since the clock anchor, 0 = unknown sentinel
    queue_wait_timepoint: AtomicU64,

    /// Source of the most recent wakeup (0 = never woken)
    last_wakeup_source: AtomicU8,

    // -- Step machinery --
    /// The coroutine step; the mutex serializes dispatch
    step: Mutex<StepFn>,

    /// Completion tracking for blocking wait
    completion_lock: Mutex<bool>,

    /// Condvar for blocking until the task finishes
    completion_condvar: Condvar,
}

impl TaskContext {
    /// Create a task context bound to `processor`
    pub fn new<F>(processor: &TaskProcessor, step: F) -> Arc<Self>
    where
        F: FnMut(&Arc<TaskContext>) -> Result<StepOutcome, StepError> + Send + 'static,
    {
        Self::with_flags(processor, false, step)
    }

    /// Create a critical task context, exempt from overload cancellation
    pub fn new_critical<F>(processor: &TaskProcessor, step: F) -> Arc<Self>
    where
        F: FnMut(&Arc<TaskContext>) -> Result<StepOutcome, StepError> + Send + 'static,
    {
        Self::with_flags(processor, true, step)
    }

    fn with_flags<F>(processor: &TaskProcessor, critical: bool, step: F) -> Arc<Self>
    where
        F: FnMut(&Arc<TaskContext>) -> Result<StepOutcome, StepError> + Send + 'static,
    {
        let counter = processor.counter_handle();
        counter.account_created();
        Arc::new_cyclic(|me| Self {
            id: TaskId::new(),
            critical,
            me: me.clone(),
            processor: processor.shared_weak(),
            counter,
            finished: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            cancellation: AtomicU8::new(0),
            queue_wait_timepoint: AtomicU64::new(0),
            last_wakeup_source: AtomicU8::new(0),
            step: Mutex::new(Box::new(step)),
            completion_lock: Mutex::new(false),
            completion_condvar: Condvar::new(),
        })
    }

    /// Get the task's unique ID
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Whether this task is exempt from overload cancellation
    pub fn is_critical(&self) -> bool {
        self.critical
    }

    /// Whether the task has run its terminal step
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Whether ownership of this task was transferred to its processor
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Mark the task detached.
    ///
    /// Sticky; must be called under the processor's detached-contexts lock so
    /// the transition is ordered against worker cleanup (see
    /// `TaskProcessor::adopt`).
    pub(crate) fn set_detached(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    // =========================================================================
    // Stepping
    // =========================================================================

    /// Advance the task by one scheduling step.
    ///
    /// Step entry is the cancellation checkpoint: a task whose cancellation
    /// was requested finishes here without running its body. A step that
    /// returns an error or panics marks the task finished and reports the
    /// error to the calling worker; it never unwinds past this method.
    pub fn do_step(&self) -> Result<(), StepError> {
        // the step mutex serializes dispatch; checks happen under it so a
        // terminal step can never be followed by another body run
        let mut step = self.step.lock();
        debug_assert!(!self.is_finished());
        if self.is_finished() {
            return Ok(());
        }
        if self.cancellation_requested() {
            self.finish();
            return Ok(());
        }

        let this = match self.me.upgrade() {
            Some(this) => this,
            None => return Ok(()),
        };
        match panic::catch_unwind(AssertUnwindSafe(|| (*step)(&this))) {
            Ok(Ok(StepOutcome::Finished)) => {
                self.finish();
                Ok(())
            }
            Ok(Ok(StepOutcome::Suspended)) => Ok(()),
            Ok(Err(error)) => {
                self.finish();
                Err(error)
            }
            Err(_panic) => {
                self.finish();
                Err(StepError::Panicked)
            }
        }
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
        let mut done = self.completion_lock.lock();
        *done = true;
        self.completion_condvar.notify_all();
    }

    /// Block until this task finishes, up to `timeout`.
    ///
    /// Returns whether the task finished.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let mut done = self.completion_lock.lock();
        if !*done {
            self.completion_condvar.wait_for(&mut done, timeout);
        }
        *done
    }

    // =========================================================================
    // Wakeup and cancellation
    // =========================================================================

    /// Transition from parked to runnable: record the wakeup source and
    /// re-schedule the task onto its assigned processor.
    ///
    /// No-op for finished tasks. If the processor is already gone the wakeup
    /// is dropped; shutdown has drained every task the processor owned.
    pub fn wakeup(&self, source: WakeupSource) {
        if self.is_finished() {
            return;
        }
        self.last_wakeup_source.store(source as u8, Ordering::Release);
        if let (Some(shared), Some(this)) = (self.processor.upgrade(), self.me.upgrade()) {
            shared.schedule_context(this);
        }
    }

    /// Source of the most recent wakeup, if the task was ever woken
    pub fn wakeup_source(&self) -> Option<WakeupSource> {
        WakeupSource::from_u8(self.last_wakeup_source.load(Ordering::Acquire))
    }

    /// Request cooperative cancellation. Idempotent, safe from any thread.
    ///
    /// The first reason to arrive sticks; `Shutdown` additionally replaces an
    /// already-stored `Overload`. The task observes the flag at its next
    /// checkpoint.
    pub fn request_cancel(&self, reason: CancellationReason) {
        let mut current = self.cancellation.load(Ordering::Acquire);
        loop {
            let replace = match CancellationReason::from_u8(current) {
                None => true,
                Some(CancellationReason::Overload) => reason == CancellationReason::Shutdown,
                Some(_) => false,
            };
            if !replace {
                return;
            }
            match self.cancellation.compare_exchange(
                current,
                reason as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Whether cancellation has been requested
    pub fn cancellation_requested(&self) -> bool {
        self.cancellation.load(Ordering::Acquire) != 0
    }

    /// The cancellation reason that stuck, if any
    pub fn cancellation_reason(&self) -> Option<CancellationReason> {
        CancellationReason::from_u8(self.cancellation.load(Ordering::Acquire))
    }

    // =========================================================================
    // Queue wait timepoint
    // =========================================================================

    /// Store the moment the task entered the queue, or `None` for the unknown
    /// sentinel when the scheduling thread skipped the clock read
    pub fn set_queue_wait_timepoint(&self, timepoint: Option<Instant>) {
        let nanos = match timepoint {
            // never collides with the sentinel: real timepoints round up to 1ns
            Some(t) => (t.saturating_duration_since(clock_anchor()).as_nanos() as u64).max(1),
            None => 0,
        };
        self.queue_wait_timepoint.store(nanos, Ordering::Release);
    }

    /// Load the queue entry timepoint; `None` means no timestamp was sampled
    pub fn queue_wait_timepoint(&self) -> Option<Instant> {
        match self.queue_wait_timepoint.load(Ordering::Acquire) {
            0 => None,
            nanos => Some(clock_anchor() + Duration::from_nanos(nanos)),
        }
    }
}

impl Drop for TaskContext {
    fn drop(&mut self) {
        self.counter.account_destroyed();
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.id)
            .field("critical", &self.critical)
            .field("finished", &self.is_finished())
            .field("detached", &self.is_detached())
            .field("cancellation", &self.cancellation_reason())
            .finish()
    }
}
