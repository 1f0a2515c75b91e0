//! Descriptor readiness multiplexing.
//!
//! This module defines the `Multiplexer` trait, the contract every readiness
//! backend implements: given the set of armed `(descriptor, interest)` pairs
//! and a maximum wait, block up to that long and report which pairs became
//! ready.
//!
//! ## Backend Selection
//!
//! Two strategies are provided:
//!
//! - **`EventBackend`**: persistent per-descriptor registrations through `mio`
//!   (epoll on Linux, kqueue on macOS and the BSDs). O(1) amortized per poll.
//! - **`PollBackend`**: a portable `poll(2)` backend that rebuilds its
//!   descriptor set on every call. O(n) per poll, always available.
//!
//! The backend is chosen once, when the loop is constructed, by probing for
//! the event-notification facility (see [`Backend::probe`]). The loop talks to
//! either one through the [`Backend`] enum, so dispatch is a plain `match`.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub mod epoll;
pub mod poll;

pub use epoll::EventBackend;
pub use poll::PollBackend;

/// The readiness a watch is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Interest {
    /// The descriptor has data to read (or the peer hung up).
    Read,
    /// The descriptor can accept a write without blocking.
    Write,
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interest::Read => write!(f, "read"),
            Interest::Write => write!(f, "write"),
        }
    }
}

/// A `(descriptor, interest)` pair that is currently listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Armed {
    pub fd: RawFd,
    pub interest: Interest,
}

/// A `(descriptor, interest)` pair reported ready by a backend.
pub type Ready = Armed;

/// The core readiness backend trait.
///
/// The loop calls `arm`/`disarm` whenever a watch starts or stops listening and
/// `release` when a watch is freed, so backends with persistent kernel state can
/// keep it in sync. Backends without persistent state may ignore those calls and
/// rebuild everything from the `armed` slice passed to `poll`.
pub trait Multiplexer {
    /// Short human readable name, used in logs.
    fn name(&self) -> &'static str;

    /// A watch on `fd` started listening for `interest`.
    fn arm(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// A watch on `fd` stopped listening for `interest` (cancelled or fired).
    fn disarm(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// The watch on `fd` for `interest` was freed; drop any per-watch resources.
    fn release(&mut self, fd: RawFd, interest: Interest);

    /// Waits up to `timeout` (`None` waits indefinitely) and returns the armed
    /// pairs that became ready. Returns an empty vector on timeout.
    fn poll(&mut self, armed: &[Armed], timeout: Option<Duration>) -> io::Result<Vec<Ready>>;

    /// Re-establishes OS-level state, e.g. after `fork`. `armed` is the complete
    /// set of listening pairs.
    fn reinit(&mut self, armed: &[Armed]) -> io::Result<()>;
}

/// Which backend a loop should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Probe for the event-notification backend, falling back to `poll(2)`.
    #[default]
    Auto,
    /// Always use the portable `poll(2)` backend.
    Poll,
    /// Require the event-notification backend.
    Event,
}

/// The backend selected for a loop.
pub enum Backend {
    Poll(PollBackend),
    Event(EventBackend),
}

impl Backend {
    /// Selects the best available backend: the event-notification backend when
    /// the OS facility can be created, `poll(2)` otherwise.
    pub fn probe(capacity: usize) -> Self {
        match EventBackend::with_capacity(capacity) {
            Ok(backend) => Backend::Event(backend),
            Err(e) => {
                tracing::warn!("event backend unavailable ({}), falling back to poll(2)", e);
                Backend::Poll(PollBackend::new())
            }
        }
    }

    /// Builds the backend requested by `kind`.
    pub fn from_kind(kind: BackendKind, capacity: usize) -> io::Result<Self> {
        let backend = match kind {
            BackendKind::Auto => Self::probe(capacity),
            BackendKind::Poll => Backend::Poll(PollBackend::new()),
            BackendKind::Event => Backend::Event(EventBackend::with_capacity(capacity)?),
        };
        tracing::debug!("selected {} backend", backend.name());
        Ok(backend)
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Backend").field(&self.name()).finish()
    }
}

impl Multiplexer for Backend {
    fn name(&self) -> &'static str {
        match self {
            Backend::Poll(b) => b.name(),
            Backend::Event(b) => b.name(),
        }
    }

    fn arm(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self {
            Backend::Poll(b) => b.arm(fd, interest),
            Backend::Event(b) => b.arm(fd, interest),
        }
    }

    fn disarm(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self {
            Backend::Poll(b) => b.disarm(fd, interest),
            Backend::Event(b) => b.disarm(fd, interest),
        }
    }

    fn release(&mut self, fd: RawFd, interest: Interest) {
        match self {
            Backend::Poll(b) => b.release(fd, interest),
            Backend::Event(b) => b.release(fd, interest),
        }
    }

    fn poll(&mut self, armed: &[Armed], timeout: Option<Duration>) -> io::Result<Vec<Ready>> {
        match self {
            Backend::Poll(b) => b.poll(armed, timeout),
            Backend::Event(b) => b.poll(armed, timeout),
        }
    }

    fn reinit(&mut self, armed: &[Armed]) -> io::Result<()> {
        match self {
            Backend::Poll(b) => b.reinit(armed),
            Backend::Event(b) => b.reinit(armed),
        }
    }
}

/// Converts an optional wait into the millisecond timeout `poll(2)` expects,
/// rounding up so a short positive wait never degenerates into a busy loop.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if Duration::from_millis(ms as u64) < d {
                ms += 1;
            }
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}
