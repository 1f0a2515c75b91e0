//! Portable `poll(2)` backend.
//!
//! Rebuilds the `pollfd` array from the armed set on every call. Nothing is
//! kept between polls, so `arm`, `disarm`, `release` and `reinit` are no-ops.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::io::{timeout_millis, Armed, Interest, Multiplexer, Ready};

/// Portable readiness backend built on `poll(2)`.
#[derive(Default)]
pub struct PollBackend {
    /// Reused between calls to avoid reallocating the descriptor array.
    fds: Vec<libc::pollfd>,
    stats: PollStats,
}

/// Counters describing the backend's activity.
#[derive(Debug, Clone, Default)]
pub struct PollStats {
    /// Number of `poll(2)` calls made.
    pub polls: u64,
    /// Number of calls that returned without any ready descriptor.
    pub timeouts: u64,
    /// Number of `(descriptor, interest)` pairs reported ready.
    pub events: u64,
}

impl std::fmt::Debug for PollBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollBackend")
            .field("fds", &self.fds.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl PollBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &PollStats {
        &self.stats
    }

    /// Collapses the armed pairs into one `pollfd` per descriptor.
    fn rebuild(&mut self, armed: &[Armed]) {
        let mut index: HashMap<RawFd, usize> = HashMap::with_capacity(armed.len());
        self.fds.clear();

        for a in armed {
            let flag = match a.interest {
                Interest::Read => libc::POLLIN,
                Interest::Write => libc::POLLOUT,
            };
            match index.get(&a.fd) {
                Some(&i) => self.fds[i].events |= flag,
                None => {
                    index.insert(a.fd, self.fds.len());
                    self.fds.push(libc::pollfd {
                        fd: a.fd,
                        events: flag,
                        revents: 0,
                    });
                }
            }
        }
    }
}

impl Multiplexer for PollBackend {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn arm(&mut self, _fd: RawFd, _interest: Interest) -> io::Result<()> {
        Ok(())
    }

    fn disarm(&mut self, _fd: RawFd, _interest: Interest) -> io::Result<()> {
        Ok(())
    }

    fn release(&mut self, _fd: RawFd, _interest: Interest) {}

    fn poll(&mut self, armed: &[Armed], timeout: Option<Duration>) -> io::Result<Vec<Ready>> {
        self.rebuild(armed);
        self.stats.polls += 1;

        // SAFETY: `fds` is a valid, exclusively borrowed slice of `pollfd`s and
        // its length is passed alongside the pointer.
        let n = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_millis(timeout),
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                // A signal arrived; let the loop dispatch it on the next tick.
                return Ok(Vec::new());
            }
            return Err(err);
        }
        if n == 0 {
            self.stats.timeouts += 1;
            return Ok(Vec::new());
        }

        let mut ready = Vec::with_capacity(n as usize);
        for pfd in &self.fds {
            if pfd.revents == 0 {
                continue;
            }
            // Hang-ups and errors wake both directions so the owner observes them
            // on the next read or write.
            let failed = pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
            if pfd.events & libc::POLLIN != 0 && (pfd.revents & libc::POLLIN != 0 || failed) {
                ready.push(Armed {
                    fd: pfd.fd,
                    interest: Interest::Read,
                });
            }
            if pfd.events & libc::POLLOUT != 0 && (pfd.revents & libc::POLLOUT != 0 || failed) {
                ready.push(Armed {
                    fd: pfd.fd,
                    interest: Interest::Write,
                });
            }
        }
        self.stats.events += ready.len() as u64;

        Ok(ready)
    }

    fn reinit(&mut self, _armed: &[Armed]) -> io::Result<()> {
        Ok(())
    }
}
