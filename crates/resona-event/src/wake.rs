//! Cross-thread wakeup for the poll loop.
//!
//! The wake signal is a descriptor that any thread may write to in order to
//! unblock the reactor thread's poll wait. On Linux it is an `eventfd`; on
//! other Unix platforms it falls back to a non-blocking pipe. Repeated
//! notifications coalesce: the reactor drains the descriptor once per wakeup,
//! and a drained descriptor becomes readable again on the next notify.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Self-signalling descriptor used to interrupt a blocking poll wait.
///
/// `notify` is safe to call from any thread; `drain` is called by the reactor
/// thread when the descriptor polls readable.
#[derive(Debug)]
pub(crate) struct WakeSignal {
    #[cfg(target_os = "linux")]
    event: OwnedFd,
    #[cfg(not(target_os = "linux"))]
    read: OwnedFd,
    #[cfg(not(target_os = "linux"))]
    write: OwnedFd,
}

impl WakeSignal {
    #[cfg(target_os = "linux")]
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: eventfd takes no pointers; the returned descriptor is
        // checked before use.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` was just created by eventfd and is owned by no one else.
        let event = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { event })
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn new() -> io::Result<Self> {
        let (read, write) = pipe_nonblocking()?;
        Ok(Self { read, write })
    }

    /// The descriptor the reactor registers for read readiness.
    pub(crate) fn raw(&self) -> RawFd {
        #[cfg(target_os = "linux")]
        {
            self.event.as_raw_fd()
        }
        #[cfg(not(target_os = "linux"))]
        {
            self.read.as_raw_fd()
        }
    }

    /// Makes the descriptor readable. Callable from any thread.
    ///
    /// A full eventfd counter (or full pipe) means a wakeup is already
    /// pending, so `EAGAIN` is ignored.
    pub(crate) fn notify(&self) {
        #[cfg(target_os = "linux")]
        let (fd, buf) = (self.event.as_raw_fd(), 1u64.to_ne_bytes());
        #[cfg(not(target_os = "linux"))]
        let (fd, buf) = (self.write.as_raw_fd(), [1u8]);

        loop {
            // SAFETY: writes from a valid buffer of the stated length to a
            // descriptor this struct owns.
            let rc = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
            if rc >= 0 {
                return;
            }
            if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                return;
            }
        }
    }

    /// Empties the descriptor so the next poll wait blocks again.
    /// Reactor thread only.
    pub(crate) fn drain(&self) {
        drain_fd(self.raw());
    }
}

/// Reads a non-blocking descriptor until it is empty.
///
/// Shared by the wake signal and the signal-watch pipes; both carry tiny
/// payloads whose content is irrelevant.
pub(crate) fn drain_fd(fd: RawFd) {
    let mut buf = [0u8; 16];
    loop {
        // SAFETY: reads at most `buf.len()` bytes into a valid stack buffer.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n > 0 {
            continue;
        }
        if n < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        // Empty (EAGAIN), closed peer, or a real error; nothing left to read.
        break;
    }
}

/// Creates a pipe with both ends non-blocking and close-on-exec.
#[cfg(target_os = "linux")]
pub(crate) fn pipe_nonblocking() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    // SAFETY: pipe2 fills the two-element array on success.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and are owned by no one else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Creates a pipe with both ends non-blocking and close-on-exec.
#[cfg(not(target_os = "linux"))]
pub(crate) fn pipe_nonblocking() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    // SAFETY: pipe fills the two-element array on success.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and are owned by no one else.
    let pair = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [pair.0.as_raw_fd(), pair.1.as_raw_fd()] {
        // SAFETY: fcntl on descriptors owned by `pair`, setting flags only.
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above.
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(pair)
}

// ===========================================================================
// Tests
// ===========================================================================
