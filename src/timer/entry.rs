use std::cell::{Cell, RefCell};
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::Result;

/// Stand-in deadline offset for intervals too long to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `now + interval`, clamped to a century out when the sum overflows.
pub(crate) fn deadline_after(now: Instant, interval: Duration) -> Instant {
    now.checked_add(interval)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Callback invoked every time a timer fires.
pub(crate) type TimerCallback = Box<dyn FnMut() -> Result<()>>;

/// Identifies a timer within its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub(crate) u64);

/// Shared record behind a [`Timer`](super::Timer) handle.
///
/// The schedule fields are `Cell`s so the queue can update them while user
/// code holds other handles to the same timer.
pub(crate) struct Entry {
    pub(crate) id: TimerId,
    pub(crate) interval: Duration,
    pub(crate) periodic: bool,
    pub(crate) deadline: Cell<Instant>,
    /// Bumped on every start/stop; heap nodes carrying an older value are stale.
    pub(crate) generation: Cell<u64>,
    pub(crate) pending: Cell<bool>,
    pub(crate) referenced: Cell<bool>,
    pub(crate) callback: RefCell<TimerCallback>,
}

impl Entry {
    pub(crate) fn new(id: TimerId, interval: Duration, periodic: bool, callback: TimerCallback) -> Self {
        Self {
            id,
            interval,
            periodic,
            deadline: Cell::new(deadline_after(Instant::now(), interval)),
            generation: Cell::new(0),
            pending: Cell::new(false),
            referenced: Cell::new(true),
            callback: RefCell::new(callback),
        }
    }

    pub(crate) fn bump(&self) -> u64 {
        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        generation
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("interval", &self.interval)
            .field("periodic", &self.periodic)
            .field("pending", &self.pending.get())
            .field("referenced", &self.referenced.get())
            .finish()
    }
}
