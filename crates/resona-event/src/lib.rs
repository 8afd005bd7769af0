//! # Resona Event
//!
//! The event reactor of the Resona audio player daemon: a single-threaded,
//! poll-driven loop that multiplexes everything the daemon reacts to.
//!
//! ## Features
//!
//! - **Timers**: deadline callbacks in strict `(deadline, insertion)` order
//! - **Idle callbacks**: run-once FIFO work for the next quiet moment
//! - **Socket monitors**: readiness dispatch for arbitrary descriptors
//! - **Deferred work**: submission from any thread, execution on the loop
//!   thread ([`Deferred`], [`blocking_call`])
//! - **Listeners and signals**: [`ServerSocket`] accept bundles and
//!   [`SignalWatch`] self-pipe signal delivery, built on the same core
//!
//! The loop is deliberately not a general async runtime: no executor, no
//! futures, no work stealing. One thread runs [`EventLoop::run`] and every
//! callback runs there, so reactor state needs no locking at all. Foreign
//! threads get a [`LoopHandle`] with exactly two powers: breaking the loop
//! and submitting deferred work.
//!
//! ## Example
//!
//! ```
//! use resona_event::EventLoop;
//! use std::time::Duration;
//!
//! let mut event_loop = EventLoop::new()?;
//! let tick = event_loop.register_timer(|lp| {
//!     // runs on the loop thread, 10ms from scheduling
//!     lp.break_loop();
//! });
//! event_loop.schedule_timer(tick, Duration::from_millis(10));
//! event_loop.run()?;
//! # Ok::<(), resona_event::Error>(())
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod call;
mod defer;
mod event_loop;
mod idle;
mod poll;
mod server;
mod signal;
mod timer;
mod wake;

pub use call::blocking_call;
pub use defer::Deferred;
pub use event_loop::{
    EventLoop, EventLoopConfig, EventLoopError, IdleHandle, LoopHandle, SocketHandle, TimerHandle,
};
pub use poll::Ready;
pub use server::{Connection, ServerSocket, ServerSocketError};
pub use signal::{SignalError, SignalWatch};

use thiserror::Error;

/// Unified error type for the event reactor.
#[derive(Debug, Error)]
pub enum Error {
    /// Event loop error
    #[error("Event loop error: {0}")]
    EventLoop(#[from] EventLoopError),

    /// Signal watch error
    #[error("Signal error: {0}")]
    Signal(#[from] SignalError),

    /// Server socket error
    #[error("Server socket error: {0}")]
    ServerSocket(#[from] ServerSocketError),
}

/// Result type for event reactor operations.
pub type Result<T> = std::result::Result<T, Error>;
