//! Descriptor watches
//!
//! A watch is an interest in one descriptor becoming readable or writable. At
//! most one watch may exist per `(descriptor, interest)` pair. Watches start
//! out idle; [`Watch::listen`] arms them with the backend and the loop fires
//! them once, from the I/O phase, when the descriptor becomes ready or the
//! optional listen timeout passes. Firing disarms the watch again.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::event_loop::LoopInner;
use crate::io::{Armed, Backend, Interest, Multiplexer};

/// Invoked with the descriptor and whether the listen timeout expired.
pub(crate) type WatchCallback = Box<dyn FnMut(RawFd, bool) -> Result<()>>;

pub(crate) struct WatchEntry {
    fd: RawFd,
    interest: Interest,
    pending: Cell<bool>,
    freed: Cell<bool>,
    deadline: Cell<Option<Instant>>,
    callback: RefCell<WatchCallback>,
}

impl WatchEntry {
    fn key(&self) -> (RawFd, Interest) {
        (self.fd, self.interest)
    }

    fn invoke(&self, expired: bool) -> Result<()> {
        (self.callback.borrow_mut())(self.fd, expired)
    }
}

/// Registry of watches plus the backend that waits on them.
pub(crate) struct WatchManager {
    backend: Backend,
    watches: HashMap<(RawFd, Interest), Rc<WatchEntry>>,
    pending: usize,
}

impl WatchManager {
    pub(crate) fn new(backend: Backend) -> Self {
        Self {
            backend,
            watches: HashMap::new(),
            pending: 0,
        }
    }

    pub(crate) fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub(crate) fn create(&mut self, fd: RawFd, interest: Interest, callback: WatchCallback) -> Result<Rc<WatchEntry>> {
        if self.watches.contains_key(&(fd, interest)) {
            return Err(Error::ResourceBusy { fd, interest });
        }
        let entry = Rc::new(WatchEntry {
            fd,
            interest,
            pending: Cell::new(false),
            freed: Cell::new(false),
            deadline: Cell::new(None),
            callback: RefCell::new(callback),
        });
        self.watches.insert((fd, interest), Rc::clone(&entry));
        Ok(entry)
    }

    /// Arms `entry`. Listening again while pending only resets the timeout.
    pub(crate) fn listen(&mut self, entry: &Rc<WatchEntry>, timeout: Option<Duration>) -> Result<()> {
        if entry.freed.get() {
            return Err(Error::Freed);
        }
        if !entry.pending.get() {
            self.backend.arm(entry.fd, entry.interest)?;
            entry.pending.set(true);
            self.pending += 1;
        }
        // A timeout too long to represent never expires.
        entry.deadline.set(timeout.and_then(|t| Instant::now().checked_add(t)));
        Ok(())
    }

    /// Disarms `entry`. Returns false if it was not pending.
    pub(crate) fn cancel(&mut self, entry: &Rc<WatchEntry>) -> bool {
        if !entry.pending.replace(false) {
            return false;
        }
        entry.deadline.set(None);
        self.pending -= 1;
        if let Err(e) = self.backend.disarm(entry.fd, entry.interest) {
            tracing::trace!("disarm of fd {} ({}) failed: {}", entry.fd, entry.interest, e);
        }
        true
    }

    pub(crate) fn free(&mut self, entry: &Rc<WatchEntry>) {
        if entry.freed.replace(true) {
            return;
        }
        self.cancel(entry);
        if let Some(current) = self.watches.get(&entry.key()) {
            if Rc::ptr_eq(current, entry) {
                self.watches.remove(&entry.key());
            }
        }
        self.backend.release(entry.fd, entry.interest);
    }

    /// Cancels and frees every watch.
    pub(crate) fn clear(&mut self) {
        let entries: Vec<_> = self.watches.values().cloned().collect();
        for entry in &entries {
            self.free(entry);
        }
    }

    /// True if no watch is listening.
    pub(crate) fn is_empty(&self) -> bool {
        self.pending == 0
    }

    pub(crate) fn len(&self) -> usize {
        self.pending
    }

    /// Nearest listen timeout among pending watches.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.listening().filter_map(|entry| entry.deadline.get()).min()
    }

    /// Waits up to `timeout` and collects the watches that should fire: ready
    /// ones first in backend order, then those whose listen timeout passed.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(Rc<WatchEntry>, bool)>> {
        let armed = match self.backend {
            Backend::Poll(_) => self.armed(),
            // Persistent registrations already mirror the armed set.
            Backend::Event(_) => Vec::new(),
        };
        let ready = self.backend.poll(&armed, timeout)?;

        let mut fired: Vec<(Rc<WatchEntry>, bool)> = ready
            .into_iter()
            .filter_map(|r| self.watches.get(&(r.fd, r.interest)))
            .filter(|entry| entry.pending.get())
            .map(|entry| (Rc::clone(entry), false))
            .collect();

        let now = Instant::now();
        let expired: Vec<_> = self
            .listening()
            .filter(|entry| entry.deadline.get().is_some_and(|d| d <= now))
            .filter(|entry| !fired.iter().any(|(f, _)| Rc::ptr_eq(f, entry)))
            .map(|entry| (Rc::clone(entry), true))
            .collect();
        fired.extend(expired);
        Ok(fired)
    }

    /// Re-creates backend registrations for every listening watch.
    pub(crate) fn reinit(&mut self) -> io::Result<()> {
        let armed = self.armed();
        self.backend.reinit(&armed)
    }

    fn listening(&self) -> impl Iterator<Item = &Rc<WatchEntry>> {
        self.watches.values().filter(|entry| entry.pending.get())
    }

    fn armed(&self) -> Vec<Armed> {
        self.listening()
            .map(|entry| Armed {
                fd: entry.fd,
                interest: entry.interest,
            })
            .collect()
    }
}

/// Polls the backend and fires every watch that became ready or timed out.
///
/// Each watch is disarmed right before its callback runs; one skipped because
/// an earlier callback in the same batch cancelled or freed it does not fire.
pub(crate) fn dispatch(inner: &LoopInner, timeout: Option<Duration>) -> Result<usize> {
    let fired = inner.watches.borrow_mut().poll(timeout)?;
    let mut count = 0;
    for (entry, expired) in fired {
        if !inner.watches.borrow_mut().cancel(&entry) {
            continue;
        }
        tracing::trace!("watch on fd {} ({}) fired, expired: {}", entry.fd, entry.interest, expired);
        count += 1;
        entry.invoke(expired)?;
    }
    Ok(count)
}

/// Handle to a descriptor watch.
///
/// The callback receives the descriptor and `true` if the listen timeout
/// expired before the descriptor became ready.
#[derive(Clone)]
pub struct Watch {
    entry: Rc<WatchEntry>,
    owner: Weak<LoopInner>,
}

impl Watch {
    pub(crate) fn new(entry: Rc<WatchEntry>, owner: Weak<LoopInner>) -> Self {
        Self { entry, owner }
    }

    pub fn descriptor(&self) -> RawFd {
        self.entry.fd
    }

    pub fn interest(&self) -> Interest {
        self.entry.interest
    }

    /// Starts listening. With `Some(timeout)`, the callback fires with
    /// `expired == true` if the descriptor is not ready in time.
    ///
    /// Fails with [`Error::Freed`] once the watch has been freed.
    pub fn listen(&self, timeout: Option<Duration>) -> Result<()> {
        let inner = self.owner.upgrade().ok_or(Error::Freed)?;
        let mut watches = inner.watches.borrow_mut();
        watches.listen(&self.entry, timeout)
    }

    /// Stops listening; the callback will not run until `listen` is called again.
    pub fn cancel(&self) {
        if let Some(inner) = self.owner.upgrade() {
            inner.watches.borrow_mut().cancel(&self.entry);
        }
    }

    /// Cancels the watch and releases its `(descriptor, interest)` slot. A freed
    /// watch can never listen again.
    pub fn free(&self) {
        match self.owner.upgrade() {
            Some(inner) => inner.watches.borrow_mut().free(&self.entry),
            None => self.entry.freed.set(true),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.entry.pending.get()
    }

    pub fn is_freed(&self) -> bool {
        self.entry.freed.get()
    }
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch")
            .field("fd", &self.entry.fd)
            .field("interest", &self.entry.interest)
            .field("pending", &self.is_pending())
            .field("freed", &self.is_freed())
            .finish()
    }
}
