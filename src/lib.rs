//! rust-evloop: a single-threaded cooperative event loop with promises
//!
//! This crate provides a user-space asynchronous runtime made of two parts:
//! - An event loop multiplexing descriptor readiness, timers, zero-delay
//!   "immediate" callbacks, signal dispatch and a throttled microtask queue
//! - A promise engine with chaining, reference-counted cancellation,
//!   timeout/delay derivation and batch combinators, driven by the loop
//!
//! Everything runs on one thread. Exactly one callback executes at a time and
//! runs to completion; the only place the loop blocks is the readiness poll at
//! the end of a tick.
//!
//! ## Backend Selection
//!
//! The readiness backend is chosen when a loop is created:
//!
//! - **epoll / kqueue** through `mio`, when the OS facility can be created
//! - **`poll(2)`** otherwise, or when requested through [`LoopConfig`]
//!
//! # The Default Loop
//!
//! Each thread has a lazily created default loop, reachable through the free
//! functions re-exported here ([`schedule`], [`timer`], [`run`], ...). A custom
//! loop can be installed once, before first use, with [`runtime_context::init`].
//!
//! ## Examples
//!
//! ```rust,no_run
//! use rust_evloop::promise::{self, Promise};
//! use std::time::Duration;
//!
//! let value = Promise::new(|resolver| {
//!     rust_evloop::timer(Duration::from_millis(10), false, move || {
//!         resolver.resolve(20);
//!         Ok(())
//!     });
//!     Ok(())
//! })
//! .then(|v| Ok(v + 1))
//! .delay(Duration::from_millis(5));
//!
//! assert_eq!(promise::wait(&value).unwrap(), 21);
//! ```
//!
//! # Signals
//!
//! Signal listeners are invoked from the first phase of a tick, never from the
//! OS handler itself.
//!
//! ```rust,no_run
//! use rust_evloop as evloop;
//!
//! let listener = evloop::signal(libc::SIGTERM, |signo| {
//!     println!("received {}, shutting down", signo);
//!     evloop::stop();
//!     Ok(())
//! })
//! .unwrap();
//! assert!(listener.is_enabled());
//! evloop::run().unwrap();
//! ```

pub mod config;
pub mod event_loop;
pub mod immediate;
pub mod io;
pub mod promise;
pub mod runtime_context;
pub mod scheduler;
pub mod signal;
pub mod timer;
pub mod watch;

// Re-export core types
pub use config::{LoopConfig, TerminationPolicy};
pub use error::{Error, Result};
pub use event_loop::Loop;
pub use immediate::Immediate;
pub use io::{BackendKind, Interest};
pub use promise::{LazyPromise, Outcome, Promise, Resolution, Resolver};
pub use runtime_context::{
    await_writable, clear, default_loop, immediate, is_empty, is_running, max_schedule_depth, periodic, poll,
    reinit, run, schedule, schedule_with, signal, signal_handling_enabled, stop, tick, timer,
};
pub use signal::Signal;
pub use timer::{Timer, TimerId};
pub use watch::Watch;

/// Error types for the runtime
pub mod error {
    use std::fmt;
    use std::io;
    use std::os::unix::io::RawFd;
    use std::rc::Rc;
    use thiserror::Error;

    use crate::io::Interest;

    /// Every failure the loop and the promise engine report.
    ///
    /// `Error` is `Clone` because a rejection reason is handed to every
    /// continuation registered on the rejected promise.
    #[derive(Error, Debug, Clone)]
    pub enum Error {
        #[error("descriptor {fd} already has a {interest} watch")]
        ResourceBusy { fd: RawFd, interest: Interest },

        #[error("watch has been freed")]
        Freed,

        #[error("invalid signal number {0}")]
        InvalidSignal(i32),

        #[error("event loop is already running")]
        AlreadyRunning,

        #[error("promise is still pending")]
        Unresolved,

        #[error("promise cancelled{}", reason_suffix(.0))]
        Cancelled(Option<String>),

        #[error("promise timed out{}", reason_suffix(.0))]
        TimedOut(Option<String>),

        #[error("type mismatch: {0}")]
        TypeMismatch(String),

        #[error("default loop already initialized")]
        AlreadyInitialized,

        #[error("IO operation failed: {0}")]
        Io(Rc<io::Error>),

        #[error("{0}")]
        Message(String),

        #[error("{0}")]
        Other(Rc<dyn std::error::Error>),
    }

    fn reason_suffix(reason: &Option<String>) -> String {
        match reason {
            Some(reason) => format!(": {}", reason),
            None => String::new(),
        }
    }

    impl Error {
        /// An error carrying only a message.
        pub fn msg(message: impl fmt::Display) -> Self {
            Error::Message(message.to_string())
        }

        /// Wraps any error type.
        pub fn other<E: std::error::Error + 'static>(error: E) -> Self {
            Error::Other(Rc::new(error))
        }

        pub fn is_cancelled(&self) -> bool {
            matches!(self, Error::Cancelled(_))
        }

        pub fn is_timed_out(&self) -> bool {
            matches!(self, Error::TimedOut(_))
        }
    }

    impl From<io::Error> for Error {
        fn from(error: io::Error) -> Self {
            Error::Io(Rc::new(error))
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;

}
