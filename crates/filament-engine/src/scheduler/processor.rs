//! Task processor: the worker pool that drives task steps
//!
//! A processor owns a fixed set of OS worker threads, the shared task queue
//! they consume, the set of detached (processor-owned) tasks, and the
//! overload policy. Scheduling is safe from any thread; workers dequeue
//! contexts and drive them one step at a time until shutdown.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, trace, warn};

use super::counter::TaskCounter;
use super::queue::{TaskQueue, TaskQueueConsumer};
use super::task::{CancellationReason, TaskContext, TaskId};

/// One real timestamp is sampled per this many schedules on a thread
const TASK_TIMESTAMP_FREQUENCY: usize = 16;

/// Worker poll window; bounds how long a stop takes to be observed
const DEQUEUE_POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Bounded wait for in-flight tasks during destruction
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_millis(10);

/// What the processor does to a task selected by the overload policy
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum OverloadAction {
    /// Account the overload but leave the task alone
    Ignore = 0,
    /// Request `Overload` cancellation on non-critical tasks
    Cancel = 1,
}

/// Construction-time processor configuration
#[derive(Debug, Clone)]
pub struct TaskProcessorConfig {
    /// Processor name, used in diagnostics
    pub name: String,
    /// Fixed worker pool size; 0 means one worker per CPU core
    pub worker_threads: usize,
    /// Label applied to worker OS threads
    pub thread_name: String,
    /// Pass-through threshold for tasks that self-profile their steps
    pub profiler_threshold: Duration,
}

impl Default for TaskProcessorConfig {
    fn default() -> Self {
        Self {
            name: "main".to_string(),
            worker_threads: 0,
            thread_name: "worker".to_string(),
            profiler_threshold: Duration::ZERO,
        }
    }
}

/// State shared between the processor handle, its workers, and its tasks.
///
/// Tasks hold a `Weak` to this so a `wakeup` can re-schedule them; the strong
/// references live in the `TaskProcessor` and the worker threads.
pub(crate) struct ProcessorShared {
    config: TaskProcessorConfig,
    task_queue: TaskQueue,
    /// Shadows the queue's approximate size for the length-overload check
    task_queue_size: AtomicUsize,
    /// Strong handles to adopted tasks, keyed by identity.
    /// Leaf lock: nothing else is acquired while it is held.
    detached_contexts: Mutex<FxHashMap<TaskId, Arc<TaskContext>>>,
    is_running: AtomicBool,
    is_shutting_down: AtomicBool,
    /// Queue-latency overload threshold in nanoseconds; 0 disables
    max_task_queue_wait_time: AtomicU64,
    /// Queue-length overload threshold; 0 disables
    max_task_queue_wait_length: AtomicUsize,
    overload_action: AtomicU8,
    /// Verdict of the last sampled queue-wait measurement; unsampled tasks
    /// inherit it
    task_queue_wait_time_overloaded: AtomicBool,
    task_counter: Arc<TaskCounter>,
}

impl ProcessorShared {
    /// Stamp the queue-entry timepoint on a context about to be enqueued.
    ///
    /// Only one in [`TASK_TIMESTAMP_FREQUENCY`] schedules per thread reads the
    /// clock; the rest store the unknown sentinel. Clock reads dominate the
    /// schedule hot path, and the cost of the approximation is that up to
    /// `TASK_TIMESTAMP_FREQUENCY - 1` successive tasks inherit the previous
    /// task's overload verdict in `check_wait_time`.
    fn set_task_queue_wait_timepoint(context: &TaskContext) {
        thread_local! {
            static SCHEDULE_COUNT: Cell<usize> = const { Cell::new(0) };
        }
        let count = SCHEDULE_COUNT.with(|counter| {
            let value = counter.get();
            counter.set(value.wrapping_add(1));
            value
        });
        if count % TASK_TIMESTAMP_FREQUENCY == 0 {
            context.set_queue_wait_timepoint(Some(Instant::now()));
        } else {
            context.set_queue_wait_timepoint(None);
        }
    }

    /// Enqueue a context for execution; callable from any thread.
    ///
    /// The `Arc` moved in is the reference handed off to the queue.
    pub(crate) fn schedule_context(&self, context: Arc<TaskContext>) {
        let max_length = self.max_task_queue_wait_length.load(Ordering::Relaxed);
        if max_length != 0
            && !context.is_critical()
            && self.task_queue_size.load(Ordering::Relaxed) >= max_length
        {
            warn!(
                task_queue_size = self.task_queue_size.load(Ordering::Relaxed),
                threshold = max_length,
                "task queue is over the length limit"
            );
            self.handle_overload(&context);
        }
        if self.is_shutting_down.load(Ordering::Acquire) {
            context.request_cancel(CancellationReason::Shutdown);
        }

        Self::set_task_queue_wait_timepoint(&context);

        self.task_queue_size.fetch_add(1, Ordering::Relaxed);
        self.task_queue.enqueue(context);
        // the task may already be executing on a worker at this point
    }

    /// Judge the dequeued context's queue latency and apply the overload
    /// policy.
    ///
    /// A context carrying the unknown sentinel keeps the previous verdict:
    /// it is treated as having the same queue wait time as the last sampled
    /// task.
    fn check_wait_time(&self, context: &TaskContext) {
        let max_wait_nanos = self.max_task_queue_wait_time.load(Ordering::Relaxed);
        if max_wait_nanos == 0 {
            self.task_queue_wait_time_overloaded
                .store(false, Ordering::Relaxed);
            return;
        }

        if let Some(timepoint) = context.queue_wait_timepoint() {
            let wait = Instant::now().saturating_duration_since(timepoint);
            trace!(
                task_id = context.id().as_u64(),
                wait_us = wait.as_micros() as u64,
                "queue wait time"
            );
            self.task_queue_wait_time_overloaded
                .store(wait.as_nanos() as u64 >= max_wait_nanos, Ordering::Relaxed);
        }

        // Critical tasks are never cancelled here, but their measured latency
        // still drives the verdict applied to the tasks behind them.
        if self.task_queue_wait_time_overloaded.load(Ordering::Relaxed) {
            self.handle_overload(context);
        }
    }

    fn handle_overload(&self, context: &TaskContext) {
        self.task_counter.account_overload();

        if self.overload_action.load(Ordering::Relaxed) == OverloadAction::Cancel as u8 {
            if !context.is_critical() {
                warn!(
                    task_id = context.id().as_u64(),
                    "task was waiting in queue for too long, cancelling"
                );
                context.request_cancel(CancellationReason::Overload);
                self.task_counter.account_cancel_overload();
            } else {
                trace!(
                    task_id = context.id().as_u64(),
                    "critical task was waiting in queue for too long, not cancelling"
                );
            }
        }
    }

    /// Dequeue the next runnable context, polling `is_running` on timeout.
    ///
    /// Returns `None` once the queue stays empty past a poll window while the
    /// processor is stopping.
    fn dequeue_task(&self, consumer: &TaskQueueConsumer) -> Option<Arc<TaskContext>> {
        loop {
            match consumer.wait_dequeue_timed(DEQUEUE_POLL_TIMEOUT) {
                Some(context) => return Some(context),
                None => {
                    self.task_counter.account_switch_slow();
                    if !self.is_running.load(Ordering::Acquire) {
                        return None;
                    }
                }
            }
        }
    }

    /// Worker thread main loop
    fn process_tasks(&self, consumer: TaskQueueConsumer) {
        while let Some(context) = self.dequeue_task(&consumer) {
            self.task_queue_size.fetch_sub(1, Ordering::Relaxed);

            self.check_wait_time(&context);

            let mut has_failed = false;
            if let Err(step_error) = context.do_step() {
                error!(
                    task_id = context.id().as_u64(),
                    error = %step_error,
                    "uncaught error from task step"
                );
                has_failed = true;
            }
            // has_failed is not observable from adopt() and breaks the
            // detached/finished latch
            if has_failed || (context.is_detached() && context.is_finished()) {
                self.detached_contexts.lock().remove(&context.id());
            }
        }
    }
}

/// A worker pool executing cooperative tasks one scheduling step at a time.
///
/// Constructed running; dropping the processor runs the shutdown protocol:
/// pre-cancel every detached task with `Shutdown`, briefly drain, stop and
/// join the workers, and assert that no task context survived.
pub struct TaskProcessor {
    shared: Arc<ProcessorShared>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskProcessor {
    /// Create a processor and start its worker pool
    pub fn new(config: TaskProcessorConfig) -> Self {
        // pin the timepoint anchor before any schedule can stamp one
        super::task::clock_anchor();

        let worker_threads = if config.worker_threads == 0 {
            num_cpus::get()
        } else {
            config.worker_threads
        };
        trace!(
            name = %config.name,
            worker_threads,
            thread_name = %config.thread_name,
            "creating task processor"
        );

        let shared = Arc::new(ProcessorShared {
            config,
            task_queue: TaskQueue::new(),
            task_queue_size: AtomicUsize::new(0),
            detached_contexts: Mutex::new(FxHashMap::default()),
            is_running: AtomicBool::new(true),
            is_shutting_down: AtomicBool::new(false),
            max_task_queue_wait_time: AtomicU64::new(0),
            max_task_queue_wait_length: AtomicUsize::new(0),
            overload_action: AtomicU8::new(OverloadAction::Ignore as u8),
            task_queue_wait_time_overloaded: AtomicBool::new(false),
            task_counter: Arc::new(TaskCounter::new()),
        });

        let mut workers = Vec::with_capacity(worker_threads);
        for index in 0..worker_threads {
            let worker_shared = shared.clone();
            let consumer = shared.task_queue.consumer();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", shared.config.thread_name, index))
                .spawn(move || worker_shared.process_tasks(consumer))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        Self { shared, workers }
    }

    /// Enqueue `context` for execution.
    ///
    /// The context must not currently be enqueued. May pre-cancel the context
    /// when the queue is over its length limit or the processor is shutting
    /// down; the context is still enqueued in both cases so its finalization
    /// runs on a worker and waiters observe the cancellation.
    pub fn schedule(&self, context: Arc<TaskContext>) {
        self.shared.schedule_context(context);
    }

    /// Transfer ownership of a still-running task to the processor.
    ///
    /// Marks the context detached; the processor keeps it alive until a
    /// worker observes it detached and finished. An already-finished context
    /// is dropped on the spot.
    pub fn adopt(&self, context: Arc<TaskContext>) {
        let mut detached = self.shared.detached_contexts.lock();
        // the detach transition is ordered against worker cleanup by this
        // lock: is_finished cannot be missed by both sides
        context.set_detached();
        if context.is_finished() {
            drop(detached);
            return;
        }
        let previous = detached.insert(context.id(), context);
        debug_assert!(previous.is_none());
    }

    /// Threshold for tasks that self-measure their step duration
    pub fn profiler_threshold(&self) -> Duration {
        self.shared.config.profiler_threshold
    }

    /// Processor name, for diagnostics
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// This processor's task accounting
    pub fn task_counter(&self) -> &TaskCounter {
        &self.shared.task_counter
    }

    /// Approximate number of contexts waiting in the queue
    pub fn task_queue_size(&self) -> usize {
        self.shared.task_queue_size.load(Ordering::Relaxed)
    }

    /// Verdict of the most recent sampled queue-wait measurement
    pub fn queue_wait_time_overloaded(&self) -> bool {
        self.shared
            .task_queue_wait_time_overloaded
            .load(Ordering::Relaxed)
    }

    /// Set the queue-latency overload threshold; zero disables it
    pub fn set_max_task_queue_wait_time(&self, max_wait_time: Duration) {
        self.shared
            .max_task_queue_wait_time
            .store(max_wait_time.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Set the queue-length overload threshold; zero disables it
    pub fn set_max_task_queue_wait_length(&self, max_length: usize) {
        self.shared
            .max_task_queue_wait_length
            .store(max_length, Ordering::Relaxed);
    }

    /// Set what happens to tasks selected by the overload policy
    pub fn set_overload_action(&self, action: OverloadAction) {
        self.shared
            .overload_action
            .store(action as u8, Ordering::Relaxed);
    }

    pub(crate) fn counter_handle(&self) -> Arc<TaskCounter> {
        self.shared.task_counter.clone()
    }

    pub(crate) fn shared_weak(&self) -> Weak<ProcessorShared> {
        Arc::downgrade(&self.shared)
    }
}

impl Drop for TaskProcessor {
    fn drop(&mut self) {
        self.shared.is_shutting_down.store(true, Ordering::SeqCst);

        {
            let detached = self.shared.detached_contexts.lock();
            for context in detached.values() {
                context.request_cancel(CancellationReason::Shutdown);
            }
        }

        // some tasks may be bound but not scheduled yet
        self.shared
            .task_counter
            .wait_for_exhaustion(SHUTDOWN_DRAIN_TIMEOUT);

        self.shared.is_running.store(false, Ordering::SeqCst);

        for worker in self.workers.drain(..) {
            worker.join().expect("worker thread panicked");
        }

        assert_eq!(
            self.shared.task_counter.value(),
            0,
            "task contexts survived processor shutdown"
        );
    }
}
