//! Event-notification backend (epoll on Linux, kqueue on macOS and the BSDs)
//!
//! This module provides the persistent-registration backend. Each descriptor
//! with at least one armed watch owns exactly one `mio` registration, keyed by
//! `Token(fd)`, which is re-registered whenever the armed interest set for that
//! descriptor changes and removed once it becomes empty or the watch is freed.
//!
//! `mio` registrations are edge triggered. A watch is disarmed as soon as it
//! fires, and arming it again re-registers the descriptor, which makes the
//! kernel re-evaluate and re-report the current readiness. That gives the loop
//! level-triggered semantics without rebuilding the whole interest set per poll.

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::io::{Armed, Interest, Multiplexer, Ready};

/// Persistent readiness backend built on `mio::Poll`.
pub struct EventBackend {
    poll: Poll,
    events: Events,
    capacity: usize,
    /// Registration state for every descriptor with an armed interest
    registrations: HashMap<RawFd, Registration>,
    stats: EventStats,
}

/// Armed interests on one descriptor and whether the kernel knows about it.
#[derive(Debug, Clone, Copy, Default)]
struct Registration {
    read: bool,
    write: bool,
    registered: bool,
}

impl Registration {
    fn set(&mut self, interest: Interest, on: bool) {
        match interest {
            Interest::Read => self.read = on,
            Interest::Write => self.write = on,
        }
    }

    fn mio_interest(&self) -> Option<mio::Interest> {
        match (self.read, self.write) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Performance and debugging statistics for the event backend
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// Number of descriptors registered with the kernel
    pub registrations: u64,

    /// Number of re-registrations caused by interest changes or re-arming
    pub reregistrations: u64,

    /// Number of poll events processed
    pub events_processed: u64,

    /// Number of polls that timed out
    pub poll_timeouts: u64,
}

impl EventBackend {
    /// Create a new event backend with the default event buffer size
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(crate::config::EVENT_CAPACITY)
    }

    /// Create a new event backend that collects up to `capacity` events per poll
    pub fn with_capacity(capacity: usize) -> io::Result<Self> {
        let capacity = capacity.max(1);
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
            capacity,
            registrations: HashMap::new(),
            stats: EventStats::default(),
        })
    }

    /// Get current performance statistics
    pub fn stats(&self) -> &EventStats {
        &self.stats
    }

    /// Number of descriptors currently registered with the kernel.
    pub fn registered(&self) -> usize {
        self.registrations.values().filter(|r| r.registered).count()
    }

    /// Brings the kernel registration for `fd` in line with its armed interests.
    fn sync(&mut self, fd: RawFd) -> io::Result<()> {
        let registry = self.poll.registry();
        let Some(reg) = self.registrations.get_mut(&fd) else {
            return Ok(());
        };

        match (reg.mio_interest(), reg.registered) {
            (Some(interest), false) => {
                registry.register(&mut SourceFd(&fd), Token(fd as usize), interest)?;
                reg.registered = true;
                self.stats.registrations += 1;
            }
            (Some(interest), true) => {
                registry.reregister(&mut SourceFd(&fd), Token(fd as usize), interest)?;
                self.stats.reregistrations += 1;
            }
            (None, true) => {
                // The descriptor may already be closed, in which case the kernel
                // has dropped it from the interest list on its own.
                if let Err(e) = registry.deregister(&mut SourceFd(&fd)) {
                    tracing::trace!("deregister of fd {} failed: {}", fd, e);
                }
                reg.registered = false;
            }
            (None, false) => {}
        }

        if reg.mio_interest().is_none() {
            self.registrations.remove(&fd);
        }
        Ok(())
    }
}

impl Multiplexer for EventBackend {
    fn name(&self) -> &'static str {
        "event"
    }

    fn arm(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let reg = self.registrations.entry(fd).or_default();
        let previous = *reg;
        reg.set(interest, true);

        if let Err(e) = self.sync(fd) {
            // Leave the descriptor exactly as it was before the failed arm.
            if previous.mio_interest().is_none() {
                self.registrations.remove(&fd);
            } else if let Some(reg) = self.registrations.get_mut(&fd) {
                *reg = previous;
            }
            return Err(e);
        }
        Ok(())
    }

    fn disarm(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self.registrations.get_mut(&fd) {
            Some(reg) => reg.set(interest, false),
            None => return Ok(()),
        }
        self.sync(fd)
    }

    fn release(&mut self, fd: RawFd, interest: Interest) {
        if let Err(e) = self.disarm(fd, interest) {
            tracing::trace!("release of fd {} ({}) failed: {}", fd, interest, e);
        }
    }

    fn poll(&mut self, _armed: &[Armed], timeout: Option<Duration>) -> io::Result<Vec<Ready>> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(e);
        }

        let mut ready = Vec::new();
        for event in self.events.iter() {
            self.stats.events_processed += 1;

            let fd = event.token().0 as RawFd;
            let Some(reg) = self.registrations.get(&fd) else {
                continue;
            };

            let failed = event.is_error();
            if reg.read && (event.is_readable() || event.is_read_closed() || failed) {
                ready.push(Armed {
                    fd,
                    interest: Interest::Read,
                });
            }
            if reg.write && (event.is_writable() || event.is_write_closed() || failed) {
                ready.push(Armed {
                    fd,
                    interest: Interest::Write,
                });
            }
        }

        if ready.is_empty() {
            self.stats.poll_timeouts += 1;
        }
        Ok(ready)
    }

    fn reinit(&mut self, armed: &[Armed]) -> io::Result<()> {
        // A forked child shares the parent's epoll instance; start over with a
        // fresh one and register every armed pair again.
        self.poll = Poll::new()?;
        self.events = Events::with_capacity(self.capacity);
        self.registrations.clear();

        for a in armed {
            self.arm(a.fd, a.interest)?;
        }
        tracing::debug!("event backend re-initialized with {} armed watches", armed.len());
        Ok(())
    }
}

impl std::fmt::Debug for EventBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBackend")
            .field("registrations", &self.registrations.len())
            .field("stats", &self.stats)
            .finish()
    }
}
