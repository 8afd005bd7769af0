//! Readiness polling over the OS multiplexer.
//!
//! [`PollGroup`] wraps [`mio::Poll`]: descriptors are registered with a token
//! and an interest mask, and a blocking [`PollGroup::wait`] stages the ready
//! set into a [`PollResult`]. The reactor dispatches from the staged result
//! and may purge entries mid-dispatch when a monitor is removed, so a stale
//! event can never reach a dead callback.
//!
//! Registration is edge-style: a descriptor that polls ready is reported
//! once, and is reported again only after new readiness arrives. Monitor
//! callbacks must therefore drain their descriptor (read or accept until
//! `WouldBlock`) before returning.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Token};
use smallvec::SmallVec;

bitflags::bitflags! {
    /// Readiness and interest bits for a monitored descriptor.
    ///
    /// `READ` and `WRITE` are valid as registration interest; `ERROR` and
    /// `HANGUP` are reported by the poller regardless of requested interest.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ready: u8 {
        /// Descriptor is readable (data, EOF, or a pending accept).
        const READ = 1 << 0;
        /// Descriptor is writable.
        const WRITE = 1 << 1;
        /// Error condition on the descriptor.
        const ERROR = 1 << 2;
        /// Peer closed its end of the connection.
        const HANGUP = 1 << 3;
    }
}

impl Ready {
    /// Converts the registration bits to the poller's interest type.
    pub(crate) fn to_interest(self) -> Interest {
        let mut interest = None;
        if self.contains(Ready::READ) {
            interest = Some(Interest::READABLE);
        }
        if self.contains(Ready::WRITE) {
            interest = Some(match interest {
                Some(i) => i | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        interest.expect("interest mask must include READ or WRITE")
    }

    pub(crate) fn from_event(event: &mio::event::Event) -> Self {
        let mut ready = Ready::empty();
        if event.is_readable() {
            ready |= Ready::READ;
        }
        if event.is_writable() {
            ready |= Ready::WRITE;
        }
        if event.is_error() {
            ready |= Ready::ERROR;
        }
        if event.is_read_closed() || event.is_write_closed() {
            ready |= Ready::HANGUP;
        }
        ready
    }
}

/// One staged entry of a poll wait: which token, and which bits fired.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollEvent {
    pub token: usize,
    pub ready: Ready,
}

/// The ready set staged by the most recent wait.
///
/// Entries are dispatched in report order. Purging an entry zeroes its event
/// bits in place rather than removing it, so indices held by the dispatch
/// loop stay valid.
#[derive(Debug, Default)]
pub(crate) struct PollResult {
    staged: SmallVec<[PollEvent; 32]>,
}

impl PollResult {
    pub(crate) fn len(&self) -> usize {
        self.staged.len()
    }

    pub(crate) fn get(&self, index: usize) -> PollEvent {
        self.staged[index]
    }

    /// Zeroes the event bits of every staged entry for `token`.
    pub(crate) fn purge(&mut self, token: usize) {
        for event in &mut self.staged {
            if event.token == token {
                event.ready = Ready::empty();
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.staged.clear();
    }

    fn push(&mut self, event: PollEvent) {
        self.staged.push(event);
    }
}

/// The registered descriptor set and the blocking wait over it.
#[derive(Debug)]
pub(crate) struct PollGroup {
    poll: mio::Poll,
    events: Events,
}

impl PollGroup {
    pub(crate) fn new(events_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: mio::Poll::new()?,
            events: Events::with_capacity(events_capacity),
        })
    }

    pub(crate) fn register(&self, fd: RawFd, token: usize, interest: Ready) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(token), interest.to_interest())
    }

    pub(crate) fn reregister(&self, fd: RawFd, token: usize, interest: Ready) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(token), interest.to_interest())
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    /// Blocks for up to `timeout` (`None` means indefinitely) and stages the
    /// ready set into `out`, replacing its previous contents.
    ///
    /// A wait interrupted by a signal is retried; every other failure is
    /// surfaced.
    pub(crate) fn wait(
        &mut self,
        out: &mut PollResult,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        out.clear();
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        for event in &self.events {
            out.push(PollEvent {
                token: event.token().0,
                ready: Ready::from_event(event),
            });
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
