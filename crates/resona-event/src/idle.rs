//! Run-once idle callbacks, drained in FIFO order.

use std::collections::VecDeque;

/// FIFO of registered idle keys.
///
/// A key appears at most once; the reactor asserts that before pushing.
#[derive(Debug, Default)]
pub(crate) struct IdleQueue {
    fifo: VecDeque<usize>,
}

impl IdleQueue {
    pub(crate) fn new() -> Self {
        Self { fifo: VecDeque::new() }
    }

    pub(crate) fn push(&mut self, key: usize) {
        debug_assert!(!self.contains(key));
        self.fifo.push_back(key);
    }

    pub(crate) fn contains(&self, key: usize) -> bool {
        self.fifo.contains(&key)
    }

    /// Removes `key` from the queue. Returns `true` if it was queued.
    pub(crate) fn remove(&mut self, key: usize) -> bool {
        match self.fifo.iter().position(|&queued| queued == key) {
            Some(index) => {
                self.fifo.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn pop(&mut self) -> Option<usize> {
        self.fifo.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
