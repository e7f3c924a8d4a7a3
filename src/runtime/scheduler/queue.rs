//! Task queue for the event loop
//!
//! A growable ring of `(fiber, value, signal)` triples awaiting resumption.
//! Loop-local: only the owning thread ever touches it, so no locking. The
//! at-most-one-schedule invariant is enforced by the fiber's `scheduled`
//! flag, not here.

use std::collections::VecDeque;

use crate::runtime::fiber::{FiberHandle, Signal};
use crate::runtime::value::Value;

/// A pending resumption.
#[derive(Debug)]
pub struct Task {
    /// Fiber to resume.
    pub fiber: FiberHandle,
    /// Value to resume it with.
    pub value: Value,
    /// Signal to resume it with (`Error` for cancellations).
    pub signal: Signal,
}

/// FIFO ring of pending tasks.
#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: VecDeque<Task>,
}

impl TaskQueue {
    /// Create an empty queue.
    #[inline]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create a queue with a pre-sized ring.
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a task.
    #[inline]
    pub fn push(&mut self, task: Task) {
        self.inner.push_back(task);
    }

    /// Pop the oldest task.
    #[inline]
    pub fn pop(&mut self) -> Option<Task> {
        self.inner.pop_front()
    }

    /// Number of pending tasks.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether no task is pending.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterate pending tasks (for the collector's mark pass).
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.inner.iter()
    }
}
