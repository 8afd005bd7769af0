//! POSIX signal delivery into the loop thread.
//!
//! The classic self-pipe construction: the OS-level handler (installed
//! through `signal-hook`, which keeps it async-signal-safe) writes one byte
//! into a non-blocking pipe, and the read end is an ordinary socket monitor.
//! Signal bursts coalesce exactly as the kernel already coalesces them: one
//! readiness, one callback.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use libc::c_int;
use signal_hook::SigId;

use crate::event_loop::{EventLoop, EventLoopError, SocketHandle};
use crate::poll::Ready;
use crate::wake;

/// Errors installing a [`SignalWatch`].
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    /// The self-pipe could not be created.
    #[error("failed to create signal pipe: {0}")]
    CreatePipe(#[source] io::Error),

    /// The OS signal handler could not be installed (e.g. an unblockable
    /// signal was requested).
    #[error("failed to install signal handler: {0}")]
    Register(#[source] io::Error),

    /// The pipe's read end could not be added to the loop.
    #[error("failed to monitor signal pipe: {0}")]
    Monitor(#[source] EventLoopError),
}

/// Routes one POSIX signal to a callback on the loop thread.
///
/// Instance-based: each watch owns its pipe and its handler registration,
/// and unrelated watches (including other crates' `signal-hook` users) are
/// unaffected. The callback runs on the loop thread with full loop access,
/// so "SIGTERM means shut down" is one line:
///
/// ```no_run
/// use resona_event::{EventLoop, SignalWatch};
///
/// let mut event_loop = EventLoop::new()?;
/// let term = SignalWatch::new(&mut event_loop, libc::SIGTERM, |lp| lp.break_loop())?;
/// event_loop.run()?;
/// term.close(&mut event_loop)?;
/// # Ok::<(), resona_event::Error>(())
/// ```
///
/// Dropping a watch always removes the OS handler (the pipe descriptors are
/// closed right after, and a handler writing into a reused descriptor must
/// be impossible). Dropping *without* [`close`](SignalWatch::close) leaves a
/// dead monitor registration behind and is logged at warn level.
pub struct SignalWatch {
    signal: c_int,
    sig_id: SigId,
    monitor: SocketHandle,
    // Field order is irrelevant here: Drop::drop unregisters the handler
    // before any field, these descriptors included, is dropped.
    read: OwnedFd,
    _write: OwnedFd,
    open: bool,
}

impl SignalWatch {
    /// Installs a handler for `signal` and registers the delivery pipe.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe cannot be created, the handler cannot be
    /// installed, or the monitor cannot be registered.
    pub fn new<F>(
        event_loop: &mut EventLoop,
        signal: c_int,
        mut on_signal: F,
    ) -> Result<Self, SignalError>
    where
        F: FnMut(&mut EventLoop) + 'static,
    {
        let (read, write) = wake::pipe_nonblocking().map_err(SignalError::CreatePipe)?;
        let sig_id = signal_hook::low_level::pipe::register_raw(signal, write.as_raw_fd())
            .map_err(SignalError::Register)?;

        let read_raw = read.as_raw_fd();
        let monitor = match event_loop.add_fd(read_raw, Ready::READ, move |lp, _ready| {
            wake::drain_fd(read_raw);
            on_signal(lp);
        }) {
            Ok(monitor) => monitor,
            Err(source) => {
                // The handler must not outlive the write end it targets.
                signal_hook::low_level::unregister(sig_id);
                return Err(SignalError::Monitor(source));
            }
        };

        tracing::debug!(signal, fd = read_raw, "signal watch installed");
        Ok(Self { signal, sig_id, monitor, read, _write: write, open: true })
    }

    /// The signal number this watch delivers.
    #[must_use]
    pub fn signal(&self) -> c_int {
        self.signal
    }

    /// Removes the handler and the monitor, consuming the watch.
    ///
    /// A signal arriving after `close` returns is handled by whatever other
    /// handlers remain installed for it, as if this watch never existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the poll backend fails to deregister the pipe;
    /// the handler is removed regardless.
    pub fn close(mut self, event_loop: &mut EventLoop) -> Result<(), EventLoopError> {
        self.open = false;
        tracing::debug!(signal = self.signal, "signal watch closed");
        // Drop runs next and unregisters the OS handler before the pipe
        // descriptors close.
        event_loop.remove_fd(self.monitor)
    }
}

impl Drop for SignalWatch {
    fn drop(&mut self) {
        // Unregister before the descriptor fields drop: once the pipe fds
        // close, their numbers can be reused, and the handler must never
        // write into someone else's descriptor.
        signal_hook::low_level::unregister(self.sig_id);
        if self.open {
            tracing::warn!(
                signal = self.signal,
                fd = self.read.as_raw_fd(),
                "signal watch dropped while still monitored"
            );
        }
    }
}

impl std::fmt::Debug for SignalWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalWatch")
            .field("signal", &self.signal)
            .field("monitor", &self.monitor)
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}
