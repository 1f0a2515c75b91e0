//! Immediate manager
//!
//! Immediates are zero-delay callbacks queued in FIFO order. The loop fires at
//! most one of them per tick so a flood of zero-delay work cannot starve I/O
//! polling; [`Immediate::execute`] fires one out of band.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::Result;
use crate::event_loop::LoopInner;

pub(crate) type ImmediateCallback = Box<dyn FnMut() -> Result<()>>;

pub(crate) struct ImmediateEntry {
    pending: Cell<bool>,
    callback: RefCell<ImmediateCallback>,
}

impl ImmediateEntry {
    /// Runs the callback unless it is already running further up the stack.
    fn invoke(&self) -> Result<()> {
        match self.callback.try_borrow_mut() {
            Ok(mut callback) => (&mut *callback)(),
            Err(_) => {
                tracing::trace!("skipping re-entrant immediate");
                Ok(())
            }
        }
    }
}

/// FIFO queue of pending immediates.
#[derive(Default)]
pub(crate) struct ImmediateQueue {
    queue: VecDeque<Rc<ImmediateEntry>>,
}

impl ImmediateQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Creates a pending immediate at the back of the queue.
    pub(crate) fn create(&mut self, callback: ImmediateCallback) -> Rc<ImmediateEntry> {
        let entry = Rc::new(ImmediateEntry {
            pending: Cell::new(true),
            callback: RefCell::new(callback),
        });
        self.queue.push_back(Rc::clone(&entry));
        entry
    }

    /// Takes the oldest pending immediate off the queue.
    pub(crate) fn pop(&mut self) -> Option<Rc<ImmediateEntry>> {
        let entry = self.queue.pop_front()?;
        entry.pending.set(false);
        Some(entry)
    }

    pub(crate) fn cancel(&mut self, entry: &Rc<ImmediateEntry>) {
        if entry.pending.replace(false) {
            self.queue.retain(|queued| !Rc::ptr_eq(queued, entry));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        for entry in self.queue.drain(..) {
            entry.pending.set(false);
        }
    }
}

/// Fires the oldest queued immediate, if any. Returns whether one ran.
pub(crate) fn fire_next(inner: &LoopInner) -> Result<bool> {
    let next = inner.immediates.borrow_mut().pop();
    match next {
        Some(entry) => {
            tracing::trace!("firing immediate");
            entry.invoke()?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Handle to an immediate registered with a loop.
#[derive(Clone)]
pub struct Immediate {
    entry: Rc<ImmediateEntry>,
    owner: Weak<LoopInner>,
}

impl Immediate {
    pub(crate) fn new(entry: Rc<ImmediateEntry>, owner: Weak<LoopInner>) -> Self {
        Self { entry, owner }
    }

    /// True while the immediate is waiting in the queue.
    pub fn is_pending(&self) -> bool {
        self.entry.pending.get()
    }

    /// Runs the callback now. A pending immediate is taken off the queue first,
    /// so it will not fire again automatically.
    pub fn execute(&self) -> Result<()> {
        self.cancel();
        self.entry.invoke()
    }

    /// Removes the immediate from the queue without running it.
    pub fn cancel(&self) {
        if let Some(inner) = self.owner.upgrade() {
            inner.immediates.borrow_mut().cancel(&self.entry);
        } else {
            self.entry.pending.set(false);
        }
    }
}

impl fmt::Debug for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Immediate")
            .field("pending", &self.is_pending())
            .finish()
    }
}
