//! Deadline timers ordered by `(due, insertion sequence)`.
//!
//! The queue is a min-heap over pending deadlines. Ties on the due instant
//! are broken by a monotonically increasing insertion sequence, so two timers
//! scheduled for the same instant fire in the order they were scheduled.
//! Firing order is fully deterministic.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

/// One pending deadline, keyed by the owning registration.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TimerEntry {
    due: Instant,
    seq: u64,
    key: usize,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap behavior (earliest first); the
        // sequence breaks due-time ties in insertion order.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending timer set with deterministic pop order.
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Inserts a deadline for `key`. The caller guarantees at most one
    /// pending entry per key.
    pub(crate) fn schedule(&mut self, key: usize, due: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry { due, seq, key });
    }

    /// Removes the pending entry for `key`, if any.
    ///
    /// Returns `true` if an entry was removed. Linear in the number of
    /// pending timers; cancellation is rare next to scheduling and firing.
    pub(crate) fn cancel(&mut self, key: usize) -> bool {
        let before = self.heap.len();
        self.heap.retain(|entry| entry.key != key);
        self.heap.len() < before
    }

    /// The earliest pending deadline, if any.
    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|entry| entry.due)
    }

    /// Pops the earliest entry whose deadline has been reached.
    ///
    /// Returns `None` when the queue is empty or the earliest deadline is
    /// still in the future.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<usize> {
        match self.heap.peek() {
            Some(entry) if entry.due <= now => {
                let entry = self.heap.pop().expect("heap should not be empty");
                Some(entry.key)
            }
            _ => None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
