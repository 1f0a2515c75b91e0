//! The event loop
//!
//! A [`Loop`] composes the signal, timer, immediate and watch managers with the
//! scheduler queue. Every [`tick`](Loop::tick) advances each of them once, in a
//! fixed order:
//!
//! 1. dispatch signals that arrived since the previous tick;
//! 2. fire expired timers, nearest deadline first;
//! 3. fire at most one immediate;
//! 4. drain the scheduler queue up to the configured depth;
//! 5. poll the backend for descriptor readiness and fire ready watches.
//!
//! [`run`](Loop::run) repeats blocking ticks until the loop is stopped or runs
//! out of work. Errors returned by callbacks are not caught: they abort the
//! current tick and propagate to the caller.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::config::LoopConfig;
use crate::error::{Error, Result};
use crate::immediate::{self, Immediate, ImmediateQueue};
use crate::io::{Backend, Interest};
use crate::scheduler::{self, Scheduler};
use crate::signal::{self, Signal, SignalManager, Source};
use crate::timer::{Timer, TimerQueue};
use crate::watch::{self, Watch, WatchManager};

/// State shared by a loop and the handles it gives out.
pub(crate) struct LoopInner {
    pub(crate) timers: RefCell<TimerQueue>,
    pub(crate) immediates: RefCell<ImmediateQueue>,
    pub(crate) scheduler: RefCell<Scheduler>,
    pub(crate) watches: RefCell<WatchManager>,
    pub(crate) signals: RefCell<SignalManager>,
    running: Cell<bool>,
}

impl LoopInner {
    pub(crate) fn stop(&self) {
        if self.running.replace(false) {
            tracing::debug!("event loop stopped");
        }
    }

    fn is_empty(&self) -> bool {
        self.timers.borrow().is_empty()
            && self.immediates.borrow().is_empty()
            && self.scheduler.borrow().is_empty()
            && self.watches.borrow().is_empty()
    }
}

/// Clears the running flag when `run` returns, errors or unwinds.
struct RunningGuard<'a>(&'a Cell<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// A single-threaded cooperative event loop.
///
/// `Loop` is a cheap, clonable handle; all clones drive the same loop. It is
/// not `Send`, every callback runs on the thread that owns the loop.
#[derive(Clone)]
pub struct Loop {
    inner: Rc<LoopInner>,
}

impl Default for Loop {
    fn default() -> Self {
        Self::new()
    }
}

impl Loop {
    /// Creates a loop with the best available backend and signal handling on.
    pub fn new() -> Self {
        let config = LoopConfig::default();
        let backend = Backend::probe(config.event_capacity);
        Self::build(backend, &config)
    }

    /// Creates a loop from `config`. Fails only if an explicitly requested
    /// backend cannot be created.
    pub fn with_config(config: LoopConfig) -> Result<Self> {
        let backend = Backend::from_kind(config.backend, config.event_capacity)?;
        Ok(Self::build(backend, &config))
    }

    fn build(backend: Backend, config: &LoopConfig) -> Self {
        let watches = WatchManager::new(backend);
        tracing::debug!("creating event loop with {} backend", watches.backend_name());
        let signals = SignalManager::new(Source::probe(config.signals), config.termination);
        Self {
            inner: Rc::new(LoopInner {
                timers: RefCell::new(TimerQueue::new()),
                immediates: RefCell::new(ImmediateQueue::new()),
                scheduler: RefCell::new(Scheduler::with_depth(config.max_schedule_depth)),
                watches: RefCell::new(watches),
                signals: RefCell::new(signals),
                running: Cell::new(false),
            }),
        }
    }

    /// Name of the readiness backend in use, `"event"` or `"poll"`.
    pub fn backend_name(&self) -> &'static str {
        self.inner.watches.borrow().backend_name()
    }

    /// True if OS signals are delivered to listeners registered with this loop.
    pub fn signal_handling_enabled(&self) -> bool {
        self.inner.signals.borrow().is_enabled()
    }

    /// Queues `callback` on the scheduler queue. It runs during a later drain,
    /// never inline.
    pub fn schedule<F>(&self, callback: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.inner.scheduler.borrow_mut().push(Box::new(callback));
    }

    /// Like [`schedule`](Self::schedule), passing `args` to the callback.
    pub fn schedule_with<A, F>(&self, callback: F, args: A)
    where
        A: 'static,
        F: FnOnce(A) -> Result<()> + 'static,
    {
        self.schedule(move || callback(args));
    }

    /// Creates and starts a timer firing after `interval`, and then every
    /// `interval` if `periodic` is set.
    pub fn timer<F>(&self, interval: Duration, periodic: bool, callback: F) -> Timer
    where
        F: FnMut() -> Result<()> + 'static,
    {
        let mut timers = self.inner.timers.borrow_mut();
        let entry = timers.create(interval, periodic, Box::new(callback));
        timers.start(&entry, Instant::now());
        Timer::new(entry, Rc::downgrade(&self.inner))
    }

    /// Like [`timer`](Self::timer), passing `args` to every invocation.
    pub fn timer_with<A, F>(&self, interval: Duration, periodic: bool, mut callback: F, mut args: A) -> Timer
    where
        A: 'static,
        F: FnMut(&mut A) -> Result<()> + 'static,
    {
        self.timer(interval, periodic, move || callback(&mut args))
    }

    /// Shorthand for a periodic [`timer`](Self::timer).
    pub fn periodic<F>(&self, interval: Duration, callback: F) -> Timer
    where
        F: FnMut() -> Result<()> + 'static,
    {
        self.timer(interval, true, callback)
    }

    /// Queues an immediate.
    pub fn immediate<F>(&self, callback: F) -> Immediate
    where
        F: FnMut() -> Result<()> + 'static,
    {
        let entry = self.inner.immediates.borrow_mut().create(Box::new(callback));
        Immediate::new(entry, Rc::downgrade(&self.inner))
    }

    /// Like [`immediate`](Self::immediate), passing `args` to the callback.
    pub fn immediate_with<A, F>(&self, mut callback: F, mut args: A) -> Immediate
    where
        A: 'static,
        F: FnMut(&mut A) -> Result<()> + 'static,
    {
        self.immediate(move || callback(&mut args))
    }

    /// Creates a watch for `fd` becoming readable. The watch is idle until
    /// [`Watch::listen`] is called.
    pub fn poll<F>(&self, fd: RawFd, callback: F) -> Result<Watch>
    where
        F: FnMut(RawFd, bool) -> Result<()> + 'static,
    {
        self.watch(fd, Interest::Read, Box::new(callback))
    }

    /// Creates a watch for `fd` becoming writable. The watch is idle until
    /// [`Watch::listen`] is called.
    pub fn await_writable<F>(&self, fd: RawFd, callback: F) -> Result<Watch>
    where
        F: FnMut(RawFd, bool) -> Result<()> + 'static,
    {
        self.watch(fd, Interest::Write, Box::new(callback))
    }

    fn watch(&self, fd: RawFd, interest: Interest, callback: watch::WatchCallback) -> Result<Watch> {
        let entry = self.inner.watches.borrow_mut().create(fd, interest, callback)?;
        Ok(Watch::new(entry, Rc::downgrade(&self.inner)))
    }

    /// Adds a listener for signal number `signo`. Listeners start enabled.
    pub fn signal<F>(&self, signo: i32, callback: F) -> Result<Signal>
    where
        F: FnMut(i32) -> Result<()> + 'static,
    {
        let entry = self.inner.signals.borrow_mut().listen(signo, Box::new(callback))?;
        Ok(Signal::new(entry))
    }

    /// Runs every phase once. With `blocking`, the I/O phase waits for the next
    /// timer or descriptor when nothing else is ready to run.
    ///
    /// An error from any callback ends the tick early and marks the loop as not
    /// running.
    pub fn tick(&self, blocking: bool) -> Result<()> {
        match self.tick_phases(blocking) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.stop();
                Err(e)
            }
        }
    }

    fn tick_phases(&self, blocking: bool) -> Result<()> {
        let inner = &*self.inner;
        let was_running = inner.running.get();

        signal::dispatch(inner)?;
        self.fire_timers()?;
        immediate::fire_next(inner)?;
        scheduler::drain(inner)?;

        // A loop stopped by one of this tick's callbacks must not block.
        let blocking = blocking && (!was_running || inner.running.get());
        let timeout = self.poll_timeout(blocking);
        if timeout == Some(Duration::ZERO) && inner.watches.borrow().is_empty() {
            return Ok(());
        }
        watch::dispatch(inner, timeout)?;
        Ok(())
    }

    fn fire_timers(&self) -> Result<usize> {
        let timers = &self.inner.timers;
        let cutoff = Instant::now();
        let mark = timers.borrow().mark();
        let mut fired = 0;
        loop {
            let next = timers.borrow_mut().pop_expired(cutoff, mark, Instant::now());
            let Some(entry) = next else {
                break;
            };
            fired += 1;
            (entry.callback.borrow_mut())()?;
        }
        if fired > 0 {
            tracing::trace!("fired {} timers", fired);
        }
        Ok(fired)
    }

    /// How long the I/O phase may wait.
    fn poll_timeout(&self, blocking: bool) -> Option<Duration> {
        let inner = &*self.inner;
        if !blocking
            || !inner.immediates.borrow().is_empty()
            || !inner.scheduler.borrow().is_empty()
            || inner.is_empty()
        {
            return Some(Duration::ZERO);
        }

        let timer = inner.timers.borrow_mut().next_deadline();
        let watch = inner.watches.borrow().next_deadline();
        let deadline = match (timer, watch) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Ticks until [`stop`](Self::stop) is called or the loop runs out of work.
    ///
    /// Returns `true` if the loop was stopped explicitly and `false` if it ran
    /// out of work. Calling `run` on a loop that is already running fails with
    /// [`Error::AlreadyRunning`].
    pub fn run(&self) -> Result<bool> {
        if self.inner.running.get() {
            tracing::error!("event loop is already running");
            return Err(Error::AlreadyRunning);
        }
        self.inner.running.set(true);
        let _guard = RunningGuard(&self.inner.running);
        tracing::debug!("event loop running");

        while self.inner.running.get() {
            if self.inner.is_empty() {
                tracing::debug!("event loop out of work");
                return Ok(false);
            }
            self.tick(true)?;
        }
        Ok(true)
    }

    /// Stops a running loop once the current callback returns.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// True while [`run`](Self::run) is executing.
    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// True if nothing would keep [`run`](Self::run) going: no referenced
    /// pending timer, queued immediate, scheduled callback or listening watch.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Frees every watch, stops every timer, cancels every immediate and empties
    /// the scheduler queue. Signal listeners are kept.
    pub fn clear(&self) {
        let inner = &*self.inner;
        inner.watches.borrow_mut().clear();
        inner.timers.borrow_mut().clear();
        inner.immediates.borrow_mut().clear();
        inner.scheduler.borrow_mut().clear();
        tracing::debug!("event loop cleared");
    }

    /// Re-creates OS-level backend state, e.g. in a child after `fork`.
    /// Listening watches keep listening.
    pub fn reinit(&self) -> Result<()> {
        self.inner.watches.borrow_mut().reinit()?;
        tracing::debug!("event loop re-initialized");
        Ok(())
    }

    /// With `Some(depth)`, sets how many scheduled callbacks run per tick (at
    /// least 1) and returns the previous value. With `None`, returns the
    /// current value.
    pub fn max_schedule_depth(&self, depth: Option<usize>) -> usize {
        let mut scheduler = self.inner.scheduler.borrow_mut();
        match depth {
            Some(depth) => scheduler.set_max_depth(depth),
            None => scheduler.max_depth(),
        }
    }

    #[cfg(test)]
    pub(crate) fn ptr_eq(&self, other: &Loop) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Loop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = &*self.inner;
        f.debug_struct("Loop")
            .field("backend", &self.backend_name())
            .field("running", &inner.running.get())
            .field("timers", &inner.timers.borrow().len())
            .field("immediates", &inner.immediates.borrow().len())
            .field("scheduled", &inner.scheduler.borrow().len())
            .field("watches", &inner.watches.borrow().len())
            .finish()
    }
}
