//! Collector interface
//!
//! The mark-and-sweep collector lives outside this crate. The core consumes
//! it through two narrow operations: "mark a value as reachable" during a
//! collection cycle, and "account tracked memory" on allocation. The event
//! loop exposes a mark-all-pending hook ([`crate::EventLoop::mark_pending`])
//! that enumerates every value held alive by in-flight tasks, timeouts and
//! listeners.

use crate::runtime::value::Value;

/// Mark hook handed in by the external collector.
pub trait Marker {
    /// Mark a value (and, transitively, whatever it references) reachable.
    fn mark(&mut self, value: &Value);
}

/// Tracked-allocation counters the collector uses for pacing.
#[derive(Debug, Default, Clone)]
pub struct HeapStats {
    /// Bytes currently attributed to live concurrency objects.
    pub live_bytes: usize,
    /// Total bytes ever attributed.
    pub total_bytes: usize,
    /// Objects currently tracked.
    pub live_objects: usize,
}

impl HeapStats {
    /// Account a new tracked allocation.
    #[inline]
    pub fn allocate(&mut self, bytes: usize) {
        self.live_bytes += bytes;
        self.total_bytes += bytes;
        self.live_objects += 1;
    }

    /// Release a tracked allocation.
    #[inline]
    pub fn release(&mut self, bytes: usize) {
        self.live_bytes = self.live_bytes.saturating_sub(bytes);
        self.live_objects = self.live_objects.saturating_sub(1);
    }
}
