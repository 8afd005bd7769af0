//! Synchronous execution on the reactor thread.
//!
//! [`blocking_call`] is the bridge for code that needs a *result* back from
//! the loop thread, not just fire-and-forget submission. The player's
//! control surface uses it for queries that must read loop-owned state.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::defer::Deferred;
use crate::event_loop::LoopHandle;

struct CallState<F, T> {
    inner: Mutex<CallInner<F, T>>,
    finished: Condvar,
}

struct CallInner<F, T> {
    task: Option<F>,
    result: Option<T>,
    done: bool,
}

/// Runs `f` on the reactor thread and returns its result.
///
/// Called on the reactor thread itself, `f` runs directly. From any other
/// thread, `f` is submitted as a one-shot deferred callback and the caller
/// blocks until the loop has executed it.
///
/// The loop must run (or eventually run) for the call to complete; there is
/// no timeout. If the loop is broken before the entry is drained, or the
/// task panics on the loop thread, the caller blocks forever: the same
/// contract as every other "the loop owns this state" interaction.
///
/// # Example
///
/// ```no_run
/// use resona_event::{blocking_call, EventLoop};
///
/// let event_loop = EventLoop::new()?;
/// let handle = event_loop.handle();
/// std::thread::spawn(move || {
///     let answer = blocking_call(&handle, || 6 * 7);
///     assert_eq!(answer, 42);
/// });
/// # Ok::<(), resona_event::Error>(())
/// ```
pub fn blocking_call<F, T>(handle: &LoopHandle, f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    if handle.is_loop_thread() {
        return f();
    }

    let state = Arc::new(CallState {
        inner: Mutex::new(CallInner { task: Some(f), result: None, done: false }),
        finished: Condvar::new(),
    });

    let run_state = Arc::clone(&state);
    let deferred = Deferred::new(handle, move |_| {
        let task = run_state.inner.lock().task.take();
        // The lock is not held while the task runs; only the result
        // hand-off happens under it.
        if let Some(task) = task {
            let value = task();
            let mut inner = run_state.inner.lock();
            inner.result = Some(value);
            inner.done = true;
            run_state.finished.notify_one();
        }
    });
    deferred.schedule();

    let mut inner = state.inner.lock();
    while !inner.done {
        state.finished.wait(&mut inner);
    }
    // `deferred` is still alive here, so the entry could not have been
    // cancelled out from under the loop.
    inner.result.take().expect("result stored before done is set")
}
