//! Configuration constants for the event loop
//!
//! This module contains tunable parameters that affect loop behavior,
//! particularly around microtask throttling and backend resources, plus the
//! `LoopConfig` builder used by [`Loop::with_config`](crate::Loop::with_config).

use crate::io::BackendKind;

/// Default number of scheduled callbacks drained per tick
///
/// Work scheduled beyond this depth is deferred to the next tick so the loop
/// still gets to timers, immediates and I/O when callbacks keep scheduling
/// more callbacks.
pub const DEFAULT_MAX_SCHEDULE_DEPTH: usize = 1000;

/// Event buffer size for the event-notification backend
///
/// At most this many kernel events are collected per poll. Remaining events
/// stay queued in the kernel and are picked up by the next poll.
pub const EVENT_CAPACITY: usize = 256;

/// Signals whose default action terminates the process
///
/// When one of these arrives and no listener is enabled for it, the loop
/// applies its [`TerminationPolicy`] instead of silently swallowing it.
pub const TERMINATION_SIGNALS: [i32; 4] = [libc::SIGHUP, libc::SIGINT, libc::SIGQUIT, libc::SIGTERM];

/// What to do with a termination signal nobody is listening for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminationPolicy {
    /// Run the operating system's default action, terminating the process.
    #[default]
    Terminate,
    /// Stop the loop, so `run` returns `true`.
    StopLoop,
}

/// Options used to build a [`Loop`](crate::Loop).
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub(crate) backend: BackendKind,
    pub(crate) max_schedule_depth: usize,
    pub(crate) signals: bool,
    pub(crate) termination: TerminationPolicy,
    pub(crate) event_capacity: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            max_schedule_depth: DEFAULT_MAX_SCHEDULE_DEPTH,
            signals: true,
            termination: TerminationPolicy::default(),
            event_capacity: EVENT_CAPACITY,
        }
    }
}

impl LoopConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the readiness backend.
    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.backend = kind;
        self
    }

    /// Set the initial scheduler drain depth (clamped to at least 1).
    pub fn max_schedule_depth(mut self, depth: usize) -> Self {
        self.max_schedule_depth = depth.max(1);
        self
    }

    /// Enable or disable OS signal handling.
    pub fn signals(mut self, enabled: bool) -> Self {
        self.signals = enabled;
        self
    }

    /// Choose what happens to unhandled termination signals.
    pub fn termination(mut self, policy: TerminationPolicy) -> Self {
        self.termination = policy;
        self
    }

    /// Set the per-poll event buffer size of the event backend.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}
