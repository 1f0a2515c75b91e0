//! The thread's default loop and the functional surface built on it.
//!
//! The default loop is created on first use. [`init`] installs a custom loop
//! instead, but only before anything has touched the default one.

use once_cell::unsync::OnceCell;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event_loop::Loop;
use crate::immediate::Immediate;
use crate::signal::Signal;
use crate::timer::Timer;
use crate::watch::Watch;

thread_local! {
    static DEFAULT_LOOP: OnceCell<Loop> = OnceCell::new();
}

/// Installs `event_loop` as this thread's default loop.
///
/// Fails with [`Error::AlreadyInitialized`] if a default loop exists already,
/// whether installed by an earlier `init` or created implicitly.
pub fn init(event_loop: Loop) -> Result<()> {
    DEFAULT_LOOP.with(|cell| {
        cell.set(event_loop).map_err(|_| {
            tracing::error!("default loop already initialized");
            Error::AlreadyInitialized
        })
    })
}

/// Returns a handle to this thread's default loop, creating it if needed.
pub fn default_loop() -> Loop {
    DEFAULT_LOOP.with(|cell| cell.get_or_init(Loop::new).clone())
}

/// Runs `f` against the default loop.
pub fn with_loop<F, R>(f: F) -> R
where
    F: FnOnce(&Loop) -> R,
{
    f(&default_loop())
}

pub fn schedule<F>(callback: F)
where
    F: FnOnce() -> Result<()> + 'static,
{
    with_loop(|l| l.schedule(callback))
}

pub fn schedule_with<A, F>(callback: F, args: A)
where
    A: 'static,
    F: FnOnce(A) -> Result<()> + 'static,
{
    with_loop(|l| l.schedule_with(callback, args))
}

pub fn timer<F>(interval: Duration, periodic: bool, callback: F) -> Timer
where
    F: FnMut() -> Result<()> + 'static,
{
    with_loop(|l| l.timer(interval, periodic, callback))
}

pub fn periodic<F>(interval: Duration, callback: F) -> Timer
where
    F: FnMut() -> Result<()> + 'static,
{
    with_loop(|l| l.periodic(interval, callback))
}

pub fn immediate<F>(callback: F) -> Immediate
where
    F: FnMut() -> Result<()> + 'static,
{
    with_loop(|l| l.immediate(callback))
}

/// Creates an idle read watch on the default loop.
pub fn poll<F>(fd: RawFd, callback: F) -> Result<Watch>
where
    F: FnMut(RawFd, bool) -> Result<()> + 'static,
{
    with_loop(|l| l.poll(fd, callback))
}

/// Creates an idle write watch on the default loop.
pub fn await_writable<F>(fd: RawFd, callback: F) -> Result<Watch>
where
    F: FnMut(RawFd, bool) -> Result<()> + 'static,
{
    with_loop(|l| l.await_writable(fd, callback))
}

pub fn signal<F>(signo: i32, callback: F) -> Result<Signal>
where
    F: FnMut(i32) -> Result<()> + 'static,
{
    with_loop(|l| l.signal(signo, callback))
}

pub fn run() -> Result<bool> {
    with_loop(Loop::run)
}

pub fn tick(blocking: bool) -> Result<()> {
    with_loop(|l| l.tick(blocking))
}

pub fn stop() {
    with_loop(Loop::stop)
}

pub fn clear() {
    with_loop(Loop::clear)
}

pub fn reinit() -> Result<()> {
    with_loop(Loop::reinit)
}

pub fn is_empty() -> bool {
    with_loop(Loop::is_empty)
}

pub fn is_running() -> bool {
    with_loop(Loop::is_running)
}

pub fn max_schedule_depth(depth: Option<usize>) -> usize {
    with_loop(|l| l.max_schedule_depth(depth))
}

pub fn signal_handling_enabled() -> bool {
    with_loop(Loop::signal_handling_enabled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopConfig;

    // Each test runs on its own thread, so each gets a fresh default loop.

    #[test]
    fn test_init_before_first_use() {
        let custom = Loop::with_config(LoopConfig::new().signals(false)).unwrap();
        init(custom.clone()).unwrap();
        assert!(default_loop().ptr_eq(&custom));
        assert!(!signal_handling_enabled());
    }

    #[test]
    fn test_init_after_first_use_fails() {
        let _ = default_loop();
        let custom = Loop::with_config(LoopConfig::new().signals(false)).unwrap();
        assert!(matches!(init(custom), Err(Error::AlreadyInitialized)));
    }

    #[test]
    fn test_free_functions_drive_default_loop() {
        init(Loop::with_config(LoopConfig::new().signals(false)).unwrap()).unwrap();
        let hits = std::rc::Rc::new(std::cell::Cell::new(0));
        let h = hits.clone();
        schedule_with(
            move |n: usize| {
                h.set(h.get() + n);
                Ok(())
            },
            5,
        );
        assert!(!is_empty());
        tick(false).unwrap();
        assert_eq!(hits.get(), 5);
        assert!(is_empty());
        assert!(!run().unwrap());
    }
}
