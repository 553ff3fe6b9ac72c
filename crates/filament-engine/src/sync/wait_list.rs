//! Wait list: suspension bookkeeping for blocking primitives
//!
//! A wait list is owned by one synchronization primitive and records which
//! task contexts are parked on it, in arrival order. The primitive's state
//! transitions and the list operations are serialized by the list's lock:
//! callers lock, update their predicate, wake under the lock, then release.
//! That pattern is what rules out the classic lost-wakeup race.

use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::scheduler::{TaskContext, WakeupSource};

type Slots = VecDeque<Option<Arc<TaskContext>>>;

/// Ordered list of task contexts suspended on one primitive.
///
/// Slots are cleared, not shifted, by [`WaitList::remove`]: a task leaving on
/// its own (timeout, cancellation) may race with a `wakeup_one` that already
/// selected its slot, and the tombstone lets the wakeup path skip it without
/// re-acquiring any higher-level lock.
pub struct WaitList {
    waiting_contexts: Mutex<Slots>,
}

impl WaitList {
    /// Create an empty wait list
    pub fn new() -> Self {
        Self {
            waiting_contexts: Mutex::new(VecDeque::new()),
        }
    }

    /// Acquire the list lock.
    ///
    /// The returned guard is the proof of lock ownership that `append` and
    /// the wakeup operations require; primitives hold it across their own
    /// state transition and the wake.
    pub fn lock(&self) -> WaitListGuard<'_> {
        WaitListGuard {
            slots: self.waiting_contexts.lock(),
        }
    }

    /// Clear the first slot holding `context`, leaving a tombstone in place.
    ///
    /// Takes the lock itself: removal is initiated by the leaving task, not
    /// from a predicate check that already holds the guard. No-op when the
    /// context is not listed (it was already popped by a wakeup).
    pub fn remove(&self, context: &Arc<TaskContext>) {
        let mut slots = self.waiting_contexts.lock();
        let position = slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, context)));
        if let Some(position) = position {
            slots[position] = None;
            debug_assert!(
                !slots
                    .iter()
                    .skip(position + 1)
                    .any(|slot| slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, context))),
                "context appears more than once in a wait list"
            );
        }
    }
}

impl Default for WaitList {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof of wait-list lock ownership, with the operations that require it
pub struct WaitListGuard<'a> {
    slots: MutexGuard<'a, Slots>,
}

impl WaitListGuard<'_> {
    /// Park `context` at the tail of the list. O(1).
    pub fn append(&mut self, context: Arc<TaskContext>) {
        self.slots.push_back(Some(context));
    }

    /// Wake the first still-parked context with source `WaitList`.
    ///
    /// Tombstoned slots are popped and discarded on the way; if only
    /// tombstones remain, no wakeup happens.
    pub fn wakeup_one(&mut self) {
        while let Some(slot) = self.slots.pop_front() {
            if let Some(context) = slot {
                context.wakeup(WakeupSource::WaitList);
                break;
            }
        }
    }

    /// Wake every still-parked context in FIFO order, then clear the list
    pub fn wakeup_all(&mut self) {
        for slot in self.slots.drain(..) {
            if let Some(context) = slot {
                context.wakeup(WakeupSource::WaitList);
            }
        }
    }

    /// Whether no parked context remains (tombstones are ignored)
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|slot| slot.is_none())
    }
}
