//! MPMC task queue with timed dequeue
//!
//! Producers are arbitrary threads calling `TaskProcessor::schedule`;
//! consumers are the worker threads of a single processor. The queue is FIFO
//! per producer; no ordering across producers is promised.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use super::task::TaskContext;

/// Unbounded MPMC FIFO of runnable task contexts.
///
/// Each `Arc` pushed here is the reference `schedule` hands off to the queue;
/// a worker that dequeues it adopts that reference instead of taking another.
pub struct TaskQueue {
    sender: Sender<Arc<TaskContext>>,
    receiver: Receiver<Arc<TaskContext>>,
}

impl TaskQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    /// Enqueue a context. Non-blocking, callable from any thread.
    pub fn enqueue(&self, context: Arc<TaskContext>) {
        // cannot fail: the queue owns a receiver for its whole lifetime
        self.sender
            .send(context)
            .expect("task queue disconnected");
    }

    /// Create the dequeue handle for one consumer thread.
    ///
    /// A worker thread serves exactly one processor's queue and keeps its
    /// consumer for its whole lifetime.
    pub fn consumer(&self) -> TaskQueueConsumer {
        TaskQueueConsumer {
            receiver: self.receiver.clone(),
        }
    }

    /// Approximate number of queued contexts
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether the queue is currently empty
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-worker dequeue handle for a [`TaskQueue`]
pub struct TaskQueueConsumer {
    receiver: Receiver<Arc<TaskContext>>,
}

impl TaskQueueConsumer {
    /// Block up to `timeout` for a context; `None` on timeout
    pub fn wait_dequeue_timed(&self, timeout: Duration) -> Option<Arc<TaskContext>> {
        self.receiver.recv_timeout(timeout).ok()
    }
}
