//! Timeout heap
//!
//! Binary min-heap of `(deadline, target fiber, optional watched fiber,
//! generation, is-error)` entries. Entries whose generation no longer
//! matches the target fiber are stale; they are skipped lazily when popped
//! rather than eagerly removed.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::runtime::fiber::FiberHandle;

/// A single pending timeout.
#[derive(Debug)]
pub struct TimeoutEntry {
    /// Absolute deadline.
    pub deadline: Instant,
    /// Fiber to cancel or resume when the deadline passes.
    pub fiber: FiberHandle,
    /// For deadline-flavor entries: fire only if this fiber is unfinished.
    pub watched: Option<FiberHandle>,
    /// Generation of `fiber` at registration time.
    pub generation: u64,
    /// Cancel with a timeout error (true) or resume with nil (false).
    pub is_error: bool,
    /// Insertion sequence, for deterministic ordering of equal deadlines.
    seq: u64,
}

impl PartialEq for TimeoutEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimeoutEntry {}

impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeoutEntry {
    // Reversed: BinaryHeap is a max-heap, we want the nearest deadline on top.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of pending timeouts.
#[derive(Debug, Default)]
pub struct TimeoutHeap {
    heap: BinaryHeap<TimeoutEntry>,
    next_seq: u64,
}

impl TimeoutHeap {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a timeout entry.
    pub fn push(
        &mut self,
        deadline: Instant,
        fiber: FiberHandle,
        watched: Option<FiberHandle>,
        is_error: bool,
    ) {
        let generation = fiber.generation();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimeoutEntry {
            deadline,
            fiber,
            watched,
            generation,
            is_error,
            seq,
        });
    }

    /// Pop the next entry whose deadline is at or before `now`, skipping
    /// stale entries (generation mismatch) along the way.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimeoutEntry> {
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                return None;
            }
            let entry = self.heap.pop().expect("peeked entry");
            // Plain wake-ups go stale when the fiber was rescheduled since
            // registration. Deadline entries watch another fiber and are
            // filtered at fire time instead.
            if entry.watched.is_none() && entry.generation != entry.fiber.generation() {
                continue;
            }
            return Some(entry);
        }
        None
    }

    /// Deadline of the nearest entry, stale or not.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Number of entries, including stale ones.
    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the heap is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Iterate entries (for the collector's mark pass).
    pub fn iter(&self) -> impl Iterator<Item = &TimeoutEntry> {
        self.heap.iter()
    }
}
