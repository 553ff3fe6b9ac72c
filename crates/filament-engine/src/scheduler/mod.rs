//! Task Scheduling - Cooperative Worker-Pool Execution
//!
//! This module implements the task processor for Filament's cooperative
//! concurrency model: a fixed pool of OS worker threads dequeues runnable
//! task contexts from a shared MPMC queue and drives each one a single
//! scheduling step at a time.

mod counter;
mod processor;
mod queue;
mod task;

pub use counter::{TaskCounter, TaskCounterSnapshot};
pub use processor::{OverloadAction, TaskProcessor, TaskProcessorConfig};
pub use queue::{TaskQueue, TaskQueueConsumer};
pub use task::{CancellationReason, StepError, StepOutcome, TaskContext, TaskId, WakeupSource};
