//! Synchronization building blocks
//!
//! Higher-level primitives (mutexes, condition variables, futures) are built
//! outside the engine core; what they all share is the wait list defined
//! here, which records the tasks suspended on a primitive and wakes them back
//! onto their processor.

mod wait_list;

pub use wait_list::{WaitList, WaitListGuard};
