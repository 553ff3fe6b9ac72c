//! Filament Engine
//!
//! The scheduling core of the Filament runtime: a multi-threaded processor
//! that drives lightweight cooperative tasks across a pool of OS worker
//! threads, plus the wait-list primitive that all blocking synchronization
//! objects are built on.
//!
//! - **Scheduler**: task processor, MPMC task queue, task contexts, and
//!   per-processor accounting (`scheduler` module)
//! - **Sync**: the wait-list suspension bookkeeping used by mutexes,
//!   condition variables, and futures (`sync` module)
//!
//! # Example
//!
//! ```rust
//! use filament_engine::scheduler::{StepOutcome, TaskContext, TaskProcessor, TaskProcessorConfig};
//!
//! let processor = TaskProcessor::new(TaskProcessorConfig {
//!     worker_threads: 2,
//!     ..Default::default()
//! });
//!
//! let task = TaskContext::new(&processor, |_ctx| Ok(StepOutcome::Finished));
//! processor.schedule(task.clone());
//! assert!(task.wait_finished(std::time::Duration::from_secs(1)));
//! drop(task);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Scheduler module: task processor, task queue, contexts, and accounting
pub mod scheduler;

/// Sync module: wait-list building block for blocking primitives
pub mod sync;
