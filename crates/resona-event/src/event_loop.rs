//! # Event Loop
//!
//! The single-threaded reactor at the heart of the daemon. One thread owns an
//! [`EventLoop`] and calls [`run`](EventLoop::run); every subsystem registers
//! callbacks and is dispatched from inside that call. Four kinds of work are
//! multiplexed:
//!
//! - **Timers**: deadline callbacks, fired in `(due, insertion)` order.
//! - **Idle callbacks**: run-once FIFO work for "the next quiet moment".
//! - **Socket monitors**: descriptor readiness dispatch.
//! - **Deferred callbacks**: work submitted from *other* threads, executed
//!   here (see [`Deferred`](crate::Deferred)).
//!
//! ## Architecture
//!
//! ```text
//!       run(): ┌─────────────────────────────────────────────┐
//!              │ 1. refresh clock                            │
//!              │ 2. fire due timers ──── quit? return        │
//!              │ 3. drain idle FIFO ──── ran any? goto 1     │
//!              │ 4. poll(timeout = next deadline) ◄─── wake ─┼── break_loop /
//!              │ 5. refresh clock                            │   deferred work
//!              │ 6. dispatch ready sockets (incl. wake fd)   │   (any thread)
//!              │ 7. clear staged results, goto 1             │
//!              └─────────────────────────────────────────────┘
//! ```
//!
//! Step 4 is the only suspension point. Timer, idle, and socket registration
//! are valid on the owning thread only; the loop is neither `Send` nor
//! `Sync`, so the compiler enforces that. Cross-thread interaction goes
//! through [`LoopHandle`]: breaking the loop and submitting deferred work.
//!
//! Callbacks receive `&mut EventLoop` and may freely register, schedule,
//! cancel, and deregister, including creating brand-new monitors the way an
//! accept handler does. The loop never catches panics: a panicking callback
//! unwinds out of `run`.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use slab::Slab;

use crate::defer::{DeferredEntry, DeferredQueue};
use crate::idle::IdleQueue;
use crate::poll::{PollGroup, PollResult, Ready};
use crate::timer::TimerQueue;
use crate::wake::WakeSignal;

/// Poll token reserved for the wake signal descriptor. Socket tokens are
/// slab keys and can never collide with it.
const WAKE_TOKEN: usize = usize::MAX;

/// Errors surfaced by the event loop.
#[derive(Debug, thiserror::Error)]
pub enum EventLoopError {
    /// The OS poller could not be created.
    #[error("failed to create poller: {0}")]
    CreatePoller(#[source] io::Error),

    /// The wake signal descriptor could not be created.
    #[error("failed to create wake signal: {0}")]
    CreateWakeSignal(#[source] io::Error),

    /// A descriptor could not be added to the poll set.
    #[error("failed to register descriptor {fd}: {source}")]
    Register {
        /// The descriptor that was being registered.
        fd: RawFd,
        /// The underlying poller failure.
        #[source]
        source: io::Error,
    },

    /// A registered descriptor's interest could not be changed.
    #[error("failed to update descriptor {fd}: {source}")]
    Modify {
        /// The descriptor that was being updated.
        fd: RawFd,
        /// The underlying poller failure.
        #[source]
        source: io::Error,
    },

    /// A descriptor could not be removed from the poll set.
    #[error("failed to deregister descriptor {fd}: {source}")]
    Deregister {
        /// The descriptor that was being removed.
        fd: RawFd,
        /// The underlying poller failure.
        #[source]
        source: io::Error,
    },

    /// The blocking wait on the poll set failed for a non-transient reason.
    #[error("poll wait failed: {0}")]
    Wait(#[source] io::Error),
}

/// Configuration for an [`EventLoop`].
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Capacity of the ready-event buffer handed to the OS multiplexer, i.e.
    /// how many descriptors can be reported per wakeup.
    pub events_capacity: usize,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self { events_capacity: 1024 }
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Identifies a registered timer callback.
///
/// Cheap to copy. A handle whose registration has been removed is *stale*;
/// using it panics rather than silently acting on a recycled slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    key: usize,
    generation: u32,
}

/// Identifies a registered idle callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleHandle {
    key: usize,
    generation: u32,
}

/// Identifies a registered socket monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketHandle {
    key: usize,
    generation: u32,
}

// ---------------------------------------------------------------------------
// Registry slots
// ---------------------------------------------------------------------------

type Callback = Rc<RefCell<dyn FnMut(&mut EventLoop)>>;
type SocketCallback = Rc<RefCell<dyn FnMut(&mut EventLoop, Ready)>>;

struct TimerSlot {
    generation: u32,
    scheduled: bool,
    run: Callback,
}

struct IdleSlot {
    generation: u32,
    run: Callback,
}

struct SocketSlot {
    generation: u32,
    fd: RawFd,
    run: SocketCallback,
}

// ---------------------------------------------------------------------------
// Shared state (the cross-thread surface)
// ---------------------------------------------------------------------------

/// State shared between the loop and foreign threads: the quit flag, the
/// wake signal, and the deferred queue. Everything else belongs to the
/// owning thread alone.
#[derive(Debug)]
pub(crate) struct LoopShared {
    quit: AtomicBool,
    wake: WakeSignal,
    deferred: DeferredQueue,
    owner: ThreadId,
}

impl LoopShared {
    pub(crate) fn add_deferred(&self, entry: &Arc<DeferredEntry>) {
        if self.deferred.submit(entry) {
            // submit returns with the queue lock already released; waking
            // after the release means a racing drain cannot consume the wake
            // and then miss the entry.
            self.wake.notify();
        }
    }

    pub(crate) fn remove_deferred(&self, entry: &Arc<DeferredEntry>) {
        self.deferred.cancel(entry);
    }

    fn break_loop(&self) {
        self.quit.store(true, Ordering::Relaxed);
        self.wake.notify();
    }

    fn quitting(&self) -> bool {
        self.quit.load(Ordering::Relaxed)
    }
}

/// Cloneable, thread-safe capability onto an [`EventLoop`].
///
/// This is the only part of the loop that may cross threads. It exposes
/// exactly the operations that are safe from anywhere: [`break_loop`]
/// (shutdown) and, via [`Deferred`](crate::Deferred), submission of work to
/// the loop thread.
///
/// [`break_loop`]: LoopHandle::break_loop
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Requests that the loop stop: sets the quit flag and wakes a blocked
    /// wait. Idempotent; callable from any thread.
    ///
    /// The loop stops at its next checkpoint; an in-flight callback is not
    /// interrupted. Pending timers and idle callbacks remain unfired.
    pub fn break_loop(&self) {
        self.shared.break_loop();
    }

    /// Whether the calling thread is the loop's owning thread.
    ///
    /// Collaborators use this to pick between acting directly and submitting
    /// deferred work; so does [`blocking_call`](crate::blocking_call).
    #[must_use]
    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.owner
    }

    pub(crate) fn shared(&self) -> &Arc<LoopShared> {
        &self.shared
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("quitting", &self.shared.quitting())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// EventLoop
// ---------------------------------------------------------------------------

/// The single-threaded poll-driven reactor.
///
/// Not `Send` and not `Sync`: the loop lives and dies on the thread that
/// created it, which is what makes its lock-free registration APIs sound.
/// Foreign threads interact through [`LoopHandle`] and
/// [`Deferred`](crate::Deferred) only.
///
/// Dropping the loop requires that no timer is scheduled and no idle
/// callback is queued (debug-asserted): collaborators deregister before the
/// loop goes away, exactly as they must not outlive the descriptors they
/// registered.
///
/// # Example
///
/// ```
/// use resona_event::EventLoop;
/// use std::time::Duration;
///
/// let mut event_loop = EventLoop::new()?;
/// let tick = event_loop.register_timer(|lp| lp.break_loop());
/// event_loop.schedule_timer(tick, Duration::from_millis(1));
/// event_loop.run()?;
/// # Ok::<(), resona_event::EventLoopError>(())
/// ```
pub struct EventLoop {
    shared: Arc<LoopShared>,
    poll: PollGroup,
    staged: PollResult,
    timers: TimerQueue,
    timer_slots: Slab<TimerSlot>,
    idle: IdleQueue,
    idle_slots: Slab<IdleSlot>,
    sockets: Slab<SocketSlot>,
    now: Instant,
    generation: u32,
    started: bool,
}

impl EventLoop {
    /// Creates a loop with the default configuration, bound to the calling
    /// thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS poller or the wake signal cannot be
    /// created, or the wake descriptor cannot be registered.
    pub fn new() -> Result<Self, EventLoopError> {
        Self::with_config(EventLoopConfig::default())
    }

    /// Creates a loop with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Same as [`new`](EventLoop::new).
    pub fn with_config(config: EventLoopConfig) -> Result<Self, EventLoopError> {
        let poll = PollGroup::new(config.events_capacity).map_err(EventLoopError::CreatePoller)?;
        let wake = WakeSignal::new().map_err(EventLoopError::CreateWakeSignal)?;
        poll.register(wake.raw(), WAKE_TOKEN, Ready::READ)
            .map_err(|source| EventLoopError::Register { fd: wake.raw(), source })?;

        tracing::debug!(wake_fd = wake.raw(), "event loop created");

        Ok(Self {
            shared: Arc::new(LoopShared {
                quit: AtomicBool::new(false),
                wake,
                deferred: DeferredQueue::default(),
                owner: thread::current().id(),
            }),
            poll,
            staged: PollResult::default(),
            timers: TimerQueue::new(),
            timer_slots: Slab::new(),
            idle: IdleQueue::new(),
            idle_slots: Slab::new(),
            sockets: Slab::new(),
            now: Instant::now(),
            generation: 0,
            started: false,
        })
    }

    /// A cloneable capability for foreign threads.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle { shared: Arc::clone(&self.shared) }
    }

    /// The monotonic clock as sampled at the start of the current loop phase.
    ///
    /// Stable for the duration of a callback; refreshed between phases.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.now
    }

    /// See [`LoopHandle::break_loop`].
    pub fn break_loop(&self) {
        self.shared.break_loop();
    }

    /// Whether any timer is scheduled. Useful for graceful-shutdown checks
    /// after [`run`](EventLoop::run) returns.
    #[must_use]
    pub fn has_scheduled_timers(&self) -> bool {
        !self.timers.is_empty()
    }

    /// Whether any idle callback is queued.
    #[must_use]
    pub fn has_queued_idle(&self) -> bool {
        !self.idle.is_empty()
    }

    fn quitting(&self) -> bool {
        self.shared.quitting()
    }

    fn next_generation(&mut self) -> u32 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Registers a timer callback and returns its handle.
    ///
    /// Registration does not schedule anything; call
    /// [`schedule_timer`](EventLoop::schedule_timer). The callback fires once
    /// per expiry and must be rescheduled by its owner for periodic behavior.
    pub fn register_timer<F>(&mut self, run: F) -> TimerHandle
    where
        F: FnMut(&mut EventLoop) + 'static,
    {
        let generation = self.next_generation();
        let key = self.timer_slots.insert(TimerSlot {
            generation,
            scheduled: false,
            run: Rc::new(RefCell::new(run)),
        });
        TimerHandle { key, generation }
    }

    /// Schedules `timer` to fire `delay` after the loop clock
    /// ([`now`](EventLoop::now)).
    ///
    /// A zero-delay timer scheduled from inside a timer callback is already
    /// due and fires in the same drain pass, before the idle phase; a
    /// periodic timer re-armed from its own callback stays anchored to the
    /// pass snapshot instead of drifting by callback runtime.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale or the timer is already scheduled;
    /// owners that re-arm must cancel first (or do so from inside the firing
    /// callback, where the entry has already been removed).
    pub fn schedule_timer(&mut self, timer: TimerHandle, delay: Duration) {
        let due = self.now + delay;
        let slot = self.timer_slot_mut(timer);
        assert!(!slot.scheduled, "timer is already scheduled");
        slot.scheduled = true;
        self.timers.schedule(timer.key, due);
    }

    /// Cancels a pending expiry, guaranteeing the callback will not fire for
    /// it. No-op if not scheduled.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale.
    pub fn cancel_timer(&mut self, timer: TimerHandle) {
        let slot = self.timer_slot_mut(timer);
        if !slot.scheduled {
            return;
        }
        slot.scheduled = false;
        self.timers.cancel(timer.key);
    }

    /// Whether `timer` has a pending expiry.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale.
    #[must_use]
    pub fn timer_is_scheduled(&self, timer: TimerHandle) -> bool {
        self.timer_slot(timer).scheduled
    }

    /// Removes the registration, cancelling any pending expiry. The handle
    /// is stale afterwards.
    ///
    /// # Panics
    ///
    /// Panics if the handle is already stale.
    pub fn unregister_timer(&mut self, timer: TimerHandle) {
        self.cancel_timer(timer);
        self.timer_slots.remove(timer.key);
    }

    fn timer_slot(&self, timer: TimerHandle) -> &TimerSlot {
        let slot = self.timer_slots.get(timer.key).expect("stale timer handle");
        assert_eq!(slot.generation, timer.generation, "stale timer handle");
        slot
    }

    fn timer_slot_mut(&mut self, timer: TimerHandle) -> &mut TimerSlot {
        let slot = self.timer_slots.get_mut(timer.key).expect("stale timer handle");
        assert_eq!(slot.generation, timer.generation, "stale timer handle");
        slot
    }

    // -----------------------------------------------------------------------
    // Idle callbacks
    // -----------------------------------------------------------------------

    /// Registers an idle callback and returns its handle.
    pub fn register_idle<F>(&mut self, run: F) -> IdleHandle
    where
        F: FnMut(&mut EventLoop) + 'static,
    {
        let generation = self.next_generation();
        let key = self.idle_slots.insert(IdleSlot {
            generation,
            run: Rc::new(RefCell::new(run)),
        });
        IdleHandle { key, generation }
    }

    /// Queues `idle` to run once at the next idle opportunity.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale or already queued.
    pub fn add_idle(&mut self, idle: IdleHandle) {
        self.idle_slot(idle);
        assert!(!self.idle.contains(idle.key), "idle callback already queued");
        self.idle.push(idle.key);
    }

    /// Withdraws a queued idle callback.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale or not queued; guard with
    /// [`idle_is_queued`](EventLoop::idle_is_queued) when unsure.
    pub fn remove_idle(&mut self, idle: IdleHandle) {
        self.idle_slot(idle);
        assert!(self.idle.remove(idle.key), "idle callback not queued");
    }

    /// Whether `idle` is currently queued.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale.
    #[must_use]
    pub fn idle_is_queued(&self, idle: IdleHandle) -> bool {
        self.idle_slot(idle);
        self.idle.contains(idle.key)
    }

    /// Removes the registration, dropping it from the queue if present. The
    /// handle is stale afterwards.
    ///
    /// # Panics
    ///
    /// Panics if the handle is already stale.
    pub fn unregister_idle(&mut self, idle: IdleHandle) {
        self.idle_slot(idle);
        self.idle.remove(idle.key);
        self.idle_slots.remove(idle.key);
    }

    fn idle_slot(&self, idle: IdleHandle) -> &IdleSlot {
        let slot = self.idle_slots.get(idle.key).expect("stale idle handle");
        assert_eq!(slot.generation, idle.generation, "stale idle handle");
        slot
    }

    // -----------------------------------------------------------------------
    // Socket monitors
    // -----------------------------------------------------------------------

    /// Registers `fd` for readiness dispatch.
    ///
    /// The caller keeps ownership of the descriptor and must keep it open
    /// while registered. Readiness is edge-style: the callback must drain the
    /// descriptor (read/accept until `WouldBlock`) or it will not fire again
    /// until new readiness arrives. `ERROR`/`HANGUP` are delivered regardless
    /// of the requested interest.
    ///
    /// # Errors
    ///
    /// Returns an error if the poll backend rejects the descriptor.
    ///
    /// # Panics
    ///
    /// Panics if `interest` contains neither `READ` nor `WRITE`.
    pub fn add_fd<F>(
        &mut self,
        fd: RawFd,
        interest: Ready,
        run: F,
    ) -> Result<SocketHandle, EventLoopError>
    where
        F: FnMut(&mut EventLoop, Ready) + 'static,
    {
        assert!(
            interest.intersects(Ready::READ | Ready::WRITE),
            "socket interest must include READ or WRITE"
        );
        let generation = self.next_generation();
        let key = self.sockets.insert(SocketSlot {
            generation,
            fd,
            run: Rc::new(RefCell::new(run)),
        });
        if let Err(source) = self.poll.register(fd, key, interest) {
            self.sockets.remove(key);
            return Err(EventLoopError::Register { fd, source });
        }
        tracing::trace!(fd, token = key, "descriptor registered");
        Ok(SocketHandle { key, generation })
    }

    /// Replaces the interest mask of a registered descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the poll backend rejects the change.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale, or if `interest` contains neither
    /// `READ` nor `WRITE`.
    pub fn modify_fd(
        &mut self,
        socket: SocketHandle,
        interest: Ready,
    ) -> Result<(), EventLoopError> {
        assert!(
            interest.intersects(Ready::READ | Ready::WRITE),
            "socket interest must include READ or WRITE"
        );
        let fd = self.socket_slot(socket).fd;
        self.poll
            .reregister(fd, socket.key, interest)
            .map_err(|source| EventLoopError::Modify { fd, source })
    }

    /// Deregisters a descriptor that is still open.
    ///
    /// Any event for it already staged by the current poll batch is purged,
    /// so the callback cannot fire after removal. The handle is stale
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the poll backend fails to remove the descriptor;
    /// the monitor is gone from the loop's tables regardless.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale.
    pub fn remove_fd(&mut self, socket: SocketHandle) -> Result<(), EventLoopError> {
        self.socket_slot(socket);
        self.staged.purge(socket.key);
        let slot = self.sockets.remove(socket.key);
        tracing::trace!(fd = slot.fd, token = socket.key, "descriptor removed");
        self.poll
            .deregister(slot.fd)
            .map_err(|source| EventLoopError::Deregister { fd: slot.fd, source })
    }

    /// Forgets a monitor whose descriptor the owner has closed or is about
    /// to close.
    ///
    /// Performs no syscall (the OS drops closed descriptors from the poll
    /// set on its own) but purges any staged event, guaranteeing the
    /// callback is never invoked for a stale result. The handle is stale
    /// afterwards.
    ///
    /// # Panics
    ///
    /// Panics if the handle is stale.
    pub fn abandon_fd(&mut self, socket: SocketHandle) {
        self.socket_slot(socket);
        self.staged.purge(socket.key);
        let slot = self.sockets.remove(socket.key);
        tracing::trace!(fd = slot.fd, token = socket.key, "descriptor abandoned");
    }

    fn socket_slot(&self, socket: SocketHandle) -> &SocketSlot {
        let slot = self.sockets.get(socket.key).expect("stale socket handle");
        assert_eq!(slot.generation, socket.generation, "stale socket handle");
        slot
    }

    // -----------------------------------------------------------------------
    // The reactor state machine
    // -----------------------------------------------------------------------

    /// Runs the reactor until [`break_loop`](EventLoop::break_loop) takes
    /// effect. All registered callbacks execute inside this call, strictly
    /// sequentially.
    ///
    /// If the quit flag was already set, returns without running any phase.
    ///
    /// # Errors
    ///
    /// Returns an error if the blocking wait fails for a non-transient
    /// reason. Interrupted waits are retried.
    ///
    /// # Panics
    ///
    /// Panics if called a second time. Callback panics are not caught and
    /// unwind through this call.
    pub fn run(&mut self) -> Result<(), EventLoopError> {
        assert!(!self.started, "run() may be called only once per event loop");
        self.started = true;

        tracing::debug!("event loop running");
        let result = self.run_phases();
        tracing::debug!("event loop stopped");
        result
    }

    fn run_phases(&mut self) -> Result<(), EventLoopError> {
        while !self.quitting() {
            // Phase 1: refresh the clock.
            self.now = Instant::now();

            // Phase 2: fire due timers; the earliest remaining deadline
            // bounds the wait below.
            let timeout = loop {
                let Some(key) = self.timers.pop_due(self.now) else {
                    break self
                        .timers
                        .next_due()
                        .map(|due| due.saturating_duration_since(self.now));
                };
                let run = {
                    let slot = &mut self.timer_slots[key];
                    slot.scheduled = false;
                    Rc::clone(&slot.run)
                };
                (&mut *run.borrow_mut())(self);
                if self.quitting() {
                    return Ok(());
                }
            };

            // Phase 3: drain the idle FIFO. If anything ran, a timer may
            // have been scheduled (possibly already due); restart from the
            // top instead of sleeping through it.
            let ran_idle = !self.idle.is_empty();
            while let Some(key) = self.idle.pop() {
                let run = Rc::clone(&self.idle_slots[key].run);
                (&mut *run.borrow_mut())(self);
                if self.quitting() {
                    return Ok(());
                }
            }
            if ran_idle {
                continue;
            }

            // Phase 4: the only suspension point. The wake descriptor is
            // part of the poll set, so break_loop and deferred submission
            // interrupt the wait.
            self.poll
                .wait(&mut self.staged, timeout)
                .map_err(EventLoopError::Wait)?;

            // Phase 5: the wait may have taken arbitrary time.
            self.now = Instant::now();

            // Phase 6: dispatch staged events in report order. Entries
            // purged mid-batch by remove/abandon have empty bits and are
            // skipped.
            for index in 0..self.staged.len() {
                if self.quitting() {
                    break;
                }
                let event = self.staged.get(index);
                if event.ready.is_empty() {
                    continue;
                }
                if event.token == WAKE_TOKEN {
                    self.shared.wake.drain();
                    self.drain_deferred();
                } else {
                    let Some(slot) = self.sockets.get(event.token) else {
                        continue;
                    };
                    let run = Rc::clone(&slot.run);
                    (&mut *run.borrow_mut())(self, event.ready);
                }
            }

            // Phase 7: the staged buffer is never carried across iterations.
            self.staged.clear();
        }
        Ok(())
    }

    /// Runs queued deferred callbacks, popping one at a time so the queue
    /// lock is never held during an invocation.
    fn drain_deferred(&mut self) {
        while !self.quitting() {
            let Some(entry) = self.shared.deferred.pop() else {
                break;
            };
            entry.invoke(self);
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("timers", &self.timer_slots.len())
            .field("idle", &self.idle_slots.len())
            .field("sockets", &self.sockets.len())
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Collaborators deregister before the loop goes away; waive the
        // check when unwinding so a callback panic surfaces undisturbed.
        if !thread::panicking() {
            debug_assert!(
                self.timers.is_empty(),
                "event loop dropped with scheduled timers"
            );
            debug_assert!(
                self.idle.is_empty(),
                "event loop dropped with queued idle callbacks"
            );
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defer::Deferred;
    use std::cell::Cell;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Barrier};

    // --- Timer phase ---

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let mut event_loop = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let record = |tag: u32, order: &Rc<RefCell<Vec<u32>>>| {
            let order = Rc::clone(order);
            move |_: &mut EventLoop| order.borrow_mut().push(tag)
        };
        let late = event_loop.register_timer(record(30, &order));
        let early = event_loop.register_timer(record(10, &order));
        let middle = event_loop.register_timer(record(20, &order));

        event_loop.schedule_timer(late, Duration::from_millis(30));
        event_loop.schedule_timer(early, Duration::from_millis(10));
        event_loop.schedule_timer(middle, Duration::from_millis(20));

        let stop = event_loop.register_timer(|lp: &mut EventLoop| lp.break_loop());
        event_loop.schedule_timer(stop, Duration::from_millis(60));

        event_loop.run().unwrap();
        assert_eq!(*order.borrow(), vec![10, 20, 30]);
    }

    #[test]
    fn test_equal_delay_fires_in_insertion_order() {
        let mut event_loop = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let order_a = Rc::clone(&order);
        let a = event_loop.register_timer(move |_: &mut EventLoop| order_a.borrow_mut().push("a"));
        let order_b = Rc::clone(&order);
        let b = event_loop.register_timer(move |lp: &mut EventLoop| {
            order_b.borrow_mut().push("b");
            lp.break_loop();
        });

        event_loop.schedule_timer(a, Duration::from_millis(100));
        event_loop.schedule_timer(b, Duration::from_millis(100));

        event_loop.run().unwrap();
        assert_eq!(*order.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn test_timer_does_not_fire_early() {
        // The loop clock is sampled at construction, so the anchor must
        // precede it.
        let scheduled_at = Instant::now();
        let mut event_loop = EventLoop::new().unwrap();
        let fired_at = Rc::new(Cell::new(None));

        let fired = Rc::clone(&fired_at);
        let timer = event_loop.register_timer(move |lp: &mut EventLoop| {
            fired.set(Some(Instant::now()));
            lp.break_loop();
        });
        event_loop.schedule_timer(timer, Duration::from_millis(20));

        event_loop.run().unwrap();
        let fired_at = fired_at.get().expect("timer fired");
        assert!(fired_at.duration_since(scheduled_at) >= Duration::from_millis(20));
    }

    #[test]
    fn test_cancel_timer_prevents_firing() {
        let mut event_loop = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(false));

        let flag = Rc::clone(&fired);
        let timer = event_loop.register_timer(move |_: &mut EventLoop| flag.set(true));
        event_loop.schedule_timer(timer, Duration::from_millis(10));
        event_loop.cancel_timer(timer);
        // Idempotent on an unscheduled timer.
        event_loop.cancel_timer(timer);
        assert!(!event_loop.timer_is_scheduled(timer));

        let stop = event_loop.register_timer(|lp: &mut EventLoop| lp.break_loop());
        event_loop.schedule_timer(stop, Duration::from_millis(40));

        event_loop.run().unwrap();
        assert!(!fired.get());
    }

    #[test]
    fn test_timer_reschedule_from_own_callback() {
        let mut event_loop = EventLoop::new().unwrap();
        let count = Rc::new(Cell::new(0u32));

        let handle_cell: Rc<Cell<Option<TimerHandle>>> = Rc::new(Cell::new(None));
        let fired = Rc::clone(&count);
        let rearm = Rc::clone(&handle_cell);
        let timer = event_loop.register_timer(move |lp: &mut EventLoop| {
            let n = fired.get() + 1;
            fired.set(n);
            if n < 3 {
                lp.schedule_timer(rearm.get().expect("handle set"), Duration::from_millis(5));
            } else {
                lp.break_loop();
            }
        });
        handle_cell.set(Some(timer));

        event_loop.schedule_timer(timer, Duration::from_millis(5));
        event_loop.run().unwrap();
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn test_zero_delay_timer_from_timer_callback_fires_before_idle() {
        // Due times anchor to the pass snapshot, so a zero-delay entry
        // scheduled mid-drain is already due and the drain picks it up
        // before the idle phase runs.
        let mut event_loop = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let order_chained = Rc::clone(&order);
        let chained = event_loop.register_timer(move |_: &mut EventLoop| {
            order_chained.borrow_mut().push("chained");
        });
        let order_idle = Rc::clone(&order);
        let stop = event_loop.register_idle(move |lp: &mut EventLoop| {
            order_idle.borrow_mut().push("idle");
            lp.break_loop();
        });
        let order_first = Rc::clone(&order);
        let first = event_loop.register_timer(move |lp: &mut EventLoop| {
            order_first.borrow_mut().push("first");
            lp.schedule_timer(chained, Duration::ZERO);
            lp.add_idle(stop);
        });

        event_loop.schedule_timer(first, Duration::from_millis(5));
        event_loop.run().unwrap();
        assert_eq!(*order.borrow(), vec!["first", "chained", "idle"]);
    }

    #[test]
    #[should_panic(expected = "timer is already scheduled")]
    fn test_schedule_twice_panics() {
        let mut event_loop = EventLoop::new().unwrap();
        let timer = event_loop.register_timer(|_: &mut EventLoop| {});
        event_loop.schedule_timer(timer, Duration::from_millis(10));
        event_loop.schedule_timer(timer, Duration::from_millis(10));
    }

    #[test]
    #[should_panic(expected = "stale timer handle")]
    fn test_stale_timer_handle_panics() {
        let mut event_loop = EventLoop::new().unwrap();
        let timer = event_loop.register_timer(|_: &mut EventLoop| {});
        event_loop.unregister_timer(timer);
        event_loop.cancel_timer(timer);
    }

    #[test]
    #[should_panic(expected = "stale timer handle")]
    fn test_recycled_timer_slot_detected() {
        let mut event_loop = EventLoop::new().unwrap();
        let old = event_loop.register_timer(|_: &mut EventLoop| {});
        event_loop.unregister_timer(old);
        // Reuses the slab slot, but with a fresh generation.
        let _new = event_loop.register_timer(|_: &mut EventLoop| {});
        event_loop.cancel_timer(old);
    }

    // --- Idle phase ---

    #[test]
    fn test_idle_runs_in_fifo_order() {
        let mut event_loop = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let order_1 = Rc::clone(&order);
        let first = event_loop.register_idle(move |_: &mut EventLoop| order_1.borrow_mut().push(1));
        let order_2 = Rc::clone(&order);
        let second =
            event_loop.register_idle(move |_: &mut EventLoop| order_2.borrow_mut().push(2));
        let stop = event_loop.register_idle(|lp: &mut EventLoop| lp.break_loop());

        event_loop.add_idle(first);
        event_loop.add_idle(second);
        event_loop.add_idle(stop);

        event_loop.run().unwrap();
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_overdue_timer_from_idle_fires_without_wait() {
        // An idle callback schedules an immediately-due timer; the loop must
        // restart its timer check rather than sleep, so the whole run
        // completes without any external wakeup.
        let mut event_loop = EventLoop::new().unwrap();
        let timer_fired = Rc::new(Cell::new(false));

        let fired = Rc::clone(&timer_fired);
        let timer = event_loop.register_timer(move |lp: &mut EventLoop| {
            fired.set(true);
            lp.break_loop();
        });
        let idle = event_loop.register_idle(move |lp: &mut EventLoop| {
            lp.schedule_timer(timer, Duration::ZERO);
        });
        event_loop.add_idle(idle);

        event_loop.run().unwrap();
        assert!(timer_fired.get());
    }

    #[test]
    fn test_remove_idle_prevents_run() {
        let mut event_loop = EventLoop::new().unwrap();
        let ran = Rc::new(Cell::new(false));

        let flag = Rc::clone(&ran);
        let victim = event_loop.register_idle(move |_: &mut EventLoop| flag.set(true));
        let remover = event_loop.register_idle(move |lp: &mut EventLoop| {
            lp.remove_idle(victim);
            lp.break_loop();
        });

        event_loop.add_idle(remover);
        event_loop.add_idle(victim);
        assert!(event_loop.idle_is_queued(victim));

        event_loop.run().unwrap();
        assert!(!ran.get());
    }

    #[test]
    #[should_panic(expected = "idle callback already queued")]
    fn test_duplicate_add_idle_panics() {
        let mut event_loop = EventLoop::new().unwrap();
        let idle = event_loop.register_idle(|_: &mut EventLoop| {});
        event_loop.add_idle(idle);
        event_loop.add_idle(idle);
    }

    #[test]
    #[should_panic(expected = "idle callback not queued")]
    fn test_remove_unqueued_idle_panics() {
        let mut event_loop = EventLoop::new().unwrap();
        let idle = event_loop.register_idle(|_: &mut EventLoop| {});
        event_loop.remove_idle(idle);
    }

    // --- Break / lifecycle ---

    #[test]
    fn test_break_before_run_returns_immediately() {
        let mut event_loop = EventLoop::new().unwrap();
        event_loop.break_loop();
        let started = Instant::now();
        event_loop.run().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_break_from_foreign_thread_unblocks_wait() {
        let (handle_tx, handle_rx) = mpsc::channel();
        let reactor = thread::Builder::new()
            .name("reactor".into())
            .spawn(move || {
                let mut event_loop = EventLoop::new().unwrap();
                handle_tx.send(event_loop.handle()).unwrap();
                // No timers: the wait below is unbounded until broken.
                event_loop.run().unwrap();
            })
            .unwrap();

        let handle = handle_rx.recv().unwrap();
        assert!(!handle.is_loop_thread());
        thread::sleep(Duration::from_millis(50));
        handle.break_loop();
        // Repeated breaks are harmless.
        handle.break_loop();
        reactor.join().unwrap();
    }

    #[test]
    fn test_break_leaves_pending_timers_inspectable() {
        let mut event_loop = EventLoop::new().unwrap();
        let timer = event_loop.register_timer(|_: &mut EventLoop| {});
        event_loop.schedule_timer(timer, Duration::from_secs(600));

        event_loop.break_loop();
        event_loop.run().unwrap();

        assert!(event_loop.has_scheduled_timers());
        assert!(event_loop.timer_is_scheduled(timer));
        event_loop.cancel_timer(timer);
        assert!(!event_loop.has_scheduled_timers());
    }

    #[test]
    #[should_panic(expected = "only once")]
    fn test_run_twice_panics() {
        let mut event_loop = EventLoop::new().unwrap();
        event_loop.break_loop();
        event_loop.run().unwrap();
        let _ = event_loop.run();
    }

    #[test]
    #[should_panic(expected = "scheduled timers")]
    fn test_drop_with_scheduled_timer_asserts() {
        let mut event_loop = EventLoop::new().unwrap();
        let timer = event_loop.register_timer(|_: &mut EventLoop| {});
        event_loop.schedule_timer(timer, Duration::from_secs(600));
        drop(event_loop);
    }

    // --- Deferred integration ---

    #[test]
    fn test_deferred_runs_on_loop_thread() {
        let (handle_tx, handle_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let ran_on = Arc::new(parking_lot::Mutex::new(None));

        let ran_on_loop = Arc::clone(&ran_on);
        let reactor = thread::Builder::new()
            .name("reactor".into())
            .spawn(move || {
                let mut event_loop = EventLoop::new().unwrap();
                handle_tx.send(event_loop.handle()).unwrap();
                go_rx.recv().unwrap();
                event_loop.run().unwrap();
                thread::current().id()
            })
            .unwrap();

        let handle = handle_rx.recv().unwrap();
        let deferred = Deferred::new(&handle, move |lp| {
            *ran_on_loop.lock() = Some(thread::current().id());
            lp.break_loop();
        });
        deferred.schedule();
        go_tx.send(()).unwrap();

        let loop_thread = reactor.join().unwrap();
        assert_eq!(*ran_on.lock(), Some(loop_thread));
    }

    #[test]
    fn test_concurrent_deferred_submissions_run_once() {
        let (handle_tx, handle_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let reactor = thread::Builder::new()
            .name("reactor".into())
            .spawn(move || {
                let mut event_loop = EventLoop::new().unwrap();
                handle_tx.send(event_loop.handle()).unwrap();
                go_rx.recv().unwrap();
                event_loop.run().unwrap();
            })
            .unwrap();

        let handle = handle_rx.recv().unwrap();
        let deferred = Arc::new(Deferred::new(&handle, move |lp| {
            counter.fetch_add(1, Ordering::Relaxed);
            lp.break_loop();
        }));

        // All submissions race before the loop is allowed to drain.
        let barrier = Arc::new(Barrier::new(8));
        let submitters: Vec<_> = (0..8)
            .map(|_| {
                let deferred = Arc::clone(&deferred);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    deferred.schedule();
                })
            })
            .collect();
        for submitter in submitters {
            submitter.join().unwrap();
        }

        go_tx.send(()).unwrap();
        reactor.join().unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_double_schedule_before_drain_runs_once() {
        let (handle_tx, handle_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let reactor = thread::spawn(move || {
            let mut event_loop = EventLoop::new().unwrap();
            handle_tx.send(event_loop.handle()).unwrap();
            go_rx.recv().unwrap();
            event_loop.run().unwrap();
        });

        let handle = handle_rx.recv().unwrap();
        let deferred = Deferred::new(&handle, move |lp| {
            counter.fetch_add(1, Ordering::Relaxed);
            lp.break_loop();
        });
        deferred.schedule();
        deferred.schedule();
        assert!(deferred.is_pending());

        go_tx.send(()).unwrap();
        reactor.join().unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_deferred_cancel_prevents_run() {
        let mut event_loop = EventLoop::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let deferred = Deferred::new(&event_loop.handle(), move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        deferred.schedule();
        deferred.cancel();

        let stop = event_loop.register_timer(|lp: &mut EventLoop| lp.break_loop());
        event_loop.schedule_timer(stop, Duration::from_millis(20));
        event_loop.run().unwrap();

        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_deferred_drop_cancels_pending_submission() {
        let mut event_loop = EventLoop::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let deferred = Deferred::new(&event_loop.handle(), move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        deferred.schedule();
        drop(deferred);

        let stop = event_loop.register_timer(|lp: &mut EventLoop| lp.break_loop());
        event_loop.schedule_timer(stop, Duration::from_millis(20));
        event_loop.run().unwrap();

        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_deferred_callback_may_submit_more_deferred_work() {
        // The drain releases the queue lock around each invocation, so a
        // deferred callback can chain further submissions.
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let order_second = Arc::clone(&order);
        let second = Deferred::new(&handle, move |lp| {
            order_second.lock().push("second");
            lp.break_loop();
        });
        let order_first = Arc::clone(&order);
        let first = Deferred::new(&handle, move |_| {
            order_first.lock().push("first");
            second.schedule();
        });
        first.schedule();

        event_loop.run().unwrap();
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    // --- Socket dispatch ---

    fn nonblocking_pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn test_readable_socket_dispatches_with_read_bit() {
        let mut event_loop = EventLoop::new().unwrap();
        let (monitored, mut peer) = nonblocking_pair();
        let seen = Rc::new(Cell::new(Ready::empty()));

        peer.write_all(b"ping").unwrap();

        let seen_bits = Rc::clone(&seen);
        let monitored_fd = monitored.as_raw_fd();
        event_loop
            .add_fd(monitored_fd, Ready::READ, move |lp: &mut EventLoop, ready| {
                seen_bits.set(ready);
                let mut buf = [0u8; 16];
                let mut reader = &monitored;
                while reader.read(&mut buf).map(|n| n > 0).unwrap_or(false) {}
                lp.break_loop();
            })
            .unwrap();

        event_loop.run().unwrap();
        assert!(seen.get().contains(Ready::READ));
    }

    #[test]
    fn test_modify_fd_switches_interest() {
        let mut event_loop = EventLoop::new().unwrap();
        let (monitored, _peer) = nonblocking_pair();
        let seen = Rc::new(Cell::new(Ready::empty()));

        // No data is ever written: READ interest stays silent until the
        // timer flips the registration to WRITE, which is ready at once.
        let seen_bits = Rc::clone(&seen);
        let socket = event_loop
            .add_fd(monitored.as_raw_fd(), Ready::READ, move |lp: &mut EventLoop, ready| {
                seen_bits.set(ready);
                lp.break_loop();
            })
            .unwrap();

        let flip = event_loop.register_timer(move |lp: &mut EventLoop| {
            lp.modify_fd(socket, Ready::WRITE).unwrap();
        });
        event_loop.schedule_timer(flip, Duration::from_millis(10));

        event_loop.run().unwrap();
        assert!(seen.get().contains(Ready::WRITE));
    }

    #[test]
    fn test_remove_fd_stops_dispatch() {
        let mut event_loop = EventLoop::new().unwrap();
        let (monitored, mut peer) = nonblocking_pair();
        let hits = Rc::new(Cell::new(0u32));

        peer.write_all(b"x").unwrap();

        let hit_count = Rc::clone(&hits);
        let socket_cell: Rc<Cell<Option<SocketHandle>>> = Rc::new(Cell::new(None));
        let socket_for_cb = Rc::clone(&socket_cell);
        let socket = event_loop
            .add_fd(monitored.as_raw_fd(), Ready::READ, move |lp: &mut EventLoop, _ready| {
                hit_count.set(hit_count.get() + 1);
                lp.remove_fd(socket_for_cb.get().expect("handle set")).unwrap();
            })
            .unwrap();
        socket_cell.set(Some(socket));

        // Fresh traffic after the removal must not dispatch again.
        let poke = event_loop.register_timer(move |_: &mut EventLoop| {
            peer.write_all(b"y").unwrap();
        });
        event_loop.schedule_timer(poke, Duration::from_millis(20));
        let stop = event_loop.register_timer(|lp: &mut EventLoop| lp.break_loop());
        event_loop.schedule_timer(stop, Duration::from_millis(50));

        event_loop.run().unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_abandon_purges_staged_event() {
        // Both descriptors are ready before the wait, so both events arrive
        // in one staged batch. Whichever callback runs first abandons the
        // other monitor and closes its descriptor; the purged staged event
        // must not dispatch. Exactly one callback runs.
        let mut event_loop = EventLoop::new().unwrap();
        let (monitored_a, mut peer_a) = nonblocking_pair();
        let (monitored_b, mut peer_b) = nonblocking_pair();
        peer_a.write_all(b"a").unwrap();
        peer_b.write_all(b"b").unwrap();

        let hits = Rc::new(Cell::new(0u32));
        let handle_a: Rc<Cell<Option<SocketHandle>>> = Rc::new(Cell::new(None));
        let handle_b: Rc<Cell<Option<SocketHandle>>> = Rc::new(Cell::new(None));
        let stream_a = Rc::new(RefCell::new(Some(monitored_a)));
        let stream_b = Rc::new(RefCell::new(Some(monitored_b)));

        let make_callback = |other: Rc<Cell<Option<SocketHandle>>>,
                             other_stream: Rc<RefCell<Option<UnixStream>>>,
                             hits: Rc<Cell<u32>>| {
            move |lp: &mut EventLoop, _ready: Ready| {
                hits.set(hits.get() + 1);
                if let Some(stale) = other.take() {
                    lp.abandon_fd(stale);
                    // Dropping closes the descriptor; the OS forgets it.
                    other_stream.borrow_mut().take();
                }
                lp.break_loop();
            }
        };

        let fd_a = stream_a.borrow().as_ref().unwrap().as_raw_fd();
        let fd_b = stream_b.borrow().as_ref().unwrap().as_raw_fd();
        let socket_a = event_loop
            .add_fd(
                fd_a,
                Ready::READ,
                make_callback(Rc::clone(&handle_b), Rc::clone(&stream_b), Rc::clone(&hits)),
            )
            .unwrap();
        handle_a.set(Some(socket_a));
        let socket_b = event_loop
            .add_fd(
                fd_b,
                Ready::READ,
                make_callback(Rc::clone(&handle_a), Rc::clone(&stream_a), Rc::clone(&hits)),
            )
            .unwrap();
        handle_b.set(Some(socket_b));

        event_loop.run().unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_registration_from_socket_callback() {
        // An accept-style callback registers a brand-new monitor while the
        // loop is mid-dispatch.
        let mut event_loop = EventLoop::new().unwrap();
        let (monitored, mut peer) = nonblocking_pair();
        let (second, mut second_peer) = nonblocking_pair();
        second_peer.write_all(b"late").unwrap();

        let second_fired = Rc::new(Cell::new(false));
        peer.write_all(b"go").unwrap();

        let fired = Rc::clone(&second_fired);
        let second_fd = second.as_raw_fd();
        event_loop
            .add_fd(monitored.as_raw_fd(), Ready::READ, move |lp: &mut EventLoop, _ready| {
                let mut buf = [0u8; 8];
                let mut reader = &monitored;
                while reader.read(&mut buf).map(|n| n > 0).unwrap_or(false) {}
                let fired = Rc::clone(&fired);
                lp.add_fd(second_fd, Ready::READ, move |lp: &mut EventLoop, _ready| {
                    fired.set(true);
                    lp.break_loop();
                })
                .unwrap();
            })
            .unwrap();

        event_loop.run().unwrap();
        assert!(second_fired.get());
    }

    // --- Clock ---

    #[test]
    fn test_now_is_stable_within_a_callback_burst() {
        let mut event_loop = EventLoop::new().unwrap();
        let first_now = Rc::new(Cell::new(None));
        let second_now = Rc::new(Cell::new(None));

        let first_seen = Rc::clone(&first_now);
        let first = event_loop.register_timer(move |lp: &mut EventLoop| {
            first_seen.set(Some(lp.now()));
        });
        let second_seen = Rc::clone(&second_now);
        let second = event_loop.register_timer(move |lp: &mut EventLoop| {
            second_seen.set(Some(lp.now()));
            lp.break_loop();
        });

        // Same deadline: both drain in the same phase, under the same `now`.
        event_loop.schedule_timer(first, Duration::from_millis(10));
        event_loop.schedule_timer(second, Duration::from_millis(10));

        event_loop.run().unwrap();
        assert_eq!(first_now.get().unwrap(), second_now.get().unwrap());
    }
}
