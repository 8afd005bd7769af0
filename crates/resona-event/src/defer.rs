//! Cross-thread deferred work.
//!
//! A [`Deferred`] owns a callback that any thread may submit for execution on
//! the reactor thread. Submission is idempotent: while an entry is queued,
//! further submissions are no-ops, so a burst of notifications from producer
//! threads collapses into a single invocation. The queue is the only reactor
//! structure shared between threads; its lock is never held while a callback
//! runs.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::event_loop::{EventLoop, LoopHandle, LoopShared};

pub(crate) type DeferredFn = Box<dyn Fn(&mut EventLoop) + Send + Sync>;

/// A queue entry: the callback plus its queued-state flag.
///
/// `pending` is read and written only while holding the queue lock; the
/// atomic is for shared storage across threads, not lock-free signalling.
pub(crate) struct DeferredEntry {
    pending: AtomicBool,
    run: DeferredFn,
}

impl DeferredEntry {
    pub(crate) fn new<F>(run: F) -> Arc<Self>
    where
        F: Fn(&mut EventLoop) + Send + Sync + 'static,
    {
        Arc::new(Self {
            pending: AtomicBool::new(false),
            run: Box::new(run),
        })
    }

    /// Runs the callback. Reactor thread only; the queue lock must not be
    /// held.
    pub(crate) fn invoke(&self, event_loop: &mut EventLoop) {
        (self.run)(event_loop);
    }
}

impl fmt::Debug for DeferredEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredEntry")
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Mutex-protected FIFO of submitted entries.
#[derive(Debug, Default)]
pub(crate) struct DeferredQueue {
    fifo: Mutex<VecDeque<Arc<DeferredEntry>>>,
}

impl DeferredQueue {
    /// Queues `entry` unless it is already queued.
    ///
    /// Returns `true` if the entry was newly queued; the caller then raises
    /// the wake signal *after* this returns, i.e. after the lock is released,
    /// so a racing drain can never observe the signal before the entry.
    pub(crate) fn submit(&self, entry: &Arc<DeferredEntry>) -> bool {
        let mut fifo = self.fifo.lock();
        if entry.pending.load(Ordering::Relaxed) {
            return false;
        }
        entry.pending.store(true, Ordering::Relaxed);
        fifo.push_back(Arc::clone(entry));
        true
    }

    /// Removes `entry` if it is queued; no-op otherwise.
    pub(crate) fn cancel(&self, entry: &Arc<DeferredEntry>) -> bool {
        let mut fifo = self.fifo.lock();
        if !entry.pending.load(Ordering::Relaxed) {
            return false;
        }
        entry.pending.store(false, Ordering::Relaxed);
        fifo.retain(|queued| !Arc::ptr_eq(queued, entry));
        true
    }

    /// Pops the oldest entry and clears its queued flag.
    ///
    /// The reactor runs the returned entry with the lock released, then calls
    /// `pop` again, so a callback may submit or cancel entries (including its
    /// own) without deadlocking.
    pub(crate) fn pop(&self) -> Option<Arc<DeferredEntry>> {
        let mut fifo = self.fifo.lock();
        let entry = fifo.pop_front()?;
        entry.pending.store(false, Ordering::Relaxed);
        Some(entry)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.fifo.lock().len()
    }
}

/// Work that any thread can hand to the reactor thread.
///
/// The callback is owned by this handle's entry and runs only on the reactor
/// thread, during the wake-driven drain. [`schedule`](Deferred::schedule) and
/// [`cancel`](Deferred::cancel) are callable from any thread. Dropping the
/// handle cancels a pending submission; it does not interrupt an invocation
/// already in progress.
///
/// # Example
///
/// ```no_run
/// use resona_event::{Deferred, EventLoop};
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
///
/// let mut event_loop = EventLoop::new()?;
/// let done = Arc::new(AtomicBool::new(false));
/// let flag = Arc::clone(&done);
/// let deferred = Deferred::new(&event_loop.handle(), move |lp| {
///     flag.store(true, Ordering::Relaxed);
///     lp.break_loop();
/// });
/// deferred.schedule(); // from this or any other thread
/// event_loop.run()?;
/// assert!(done.load(Ordering::Relaxed));
/// # Ok::<(), resona_event::Error>(())
/// ```
pub struct Deferred {
    entry: Arc<DeferredEntry>,
    shared: Arc<LoopShared>,
}

impl Deferred {
    /// Creates a deferred callback bound to the loop behind `handle`.
    ///
    /// May be called on any thread; the original registers deferred monitors
    /// from producer threads and so does this.
    pub fn new<F>(handle: &LoopHandle, run: F) -> Self
    where
        F: Fn(&mut EventLoop) + Send + Sync + 'static,
    {
        Self {
            entry: DeferredEntry::new(run),
            shared: Arc::clone(handle.shared()),
        }
    }

    /// Submits the callback for execution on the reactor thread.
    ///
    /// Idempotent while already queued. Wakes the reactor if the entry was
    /// newly queued.
    pub fn schedule(&self) {
        self.shared.add_deferred(&self.entry);
    }

    /// Withdraws a pending submission; no-op if not queued.
    ///
    /// An invocation that has already started is not interrupted.
    pub fn cancel(&self) {
        self.shared.remove_deferred(&self.entry);
    }

    /// Whether the callback is currently queued.
    ///
    /// Advisory only: another thread may queue or drain the entry between
    /// this read and any action taken on it.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.entry.pending.load(Ordering::Relaxed)
    }
}

impl Drop for Deferred {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_is_idempotent_while_queued() {
        let queue = DeferredQueue::default();
        let entry = DeferredEntry::new(|_| {});

        assert!(queue.submit(&entry));
        assert!(!queue.submit(&entry));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_pop_clears_pending_and_allows_resubmit() {
        let queue = DeferredQueue::default();
        let entry = DeferredEntry::new(|_| {});

        queue.submit(&entry);
        let popped = queue.pop().unwrap();
        assert!(Arc::ptr_eq(&popped, &entry));
        assert!(!entry.pending.load(Ordering::Relaxed));

        // After a drain pop the same entry may be queued again.
        assert!(queue.submit(&entry));
    }

    #[test]
    fn test_cancel_removes_queued_entry() {
        let queue = DeferredQueue::default();
        let entry = DeferredEntry::new(|_| {});

        queue.submit(&entry);
        assert!(queue.cancel(&entry));
        assert!(!queue.cancel(&entry));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_pop_is_fifo() {
        let queue = DeferredQueue::default();
        let first = DeferredEntry::new(|_| {});
        let second = DeferredEntry::new(|_| {});

        queue.submit(&first);
        queue.submit(&second);

        assert!(Arc::ptr_eq(&queue.pop().unwrap(), &first));
        assert!(Arc::ptr_eq(&queue.pop().unwrap(), &second));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_cancel_leaves_other_entries_queued() {
        let queue = DeferredQueue::default();
        let keep = DeferredEntry::new(|_| {});
        let drop_me = DeferredEntry::new(|_| {});

        queue.submit(&keep);
        queue.submit(&drop_me);
        queue.cancel(&drop_me);

        assert!(Arc::ptr_eq(&queue.pop().unwrap(), &keep));
        assert!(queue.pop().is_none());
    }
}
