//! Timer manager
//!
//! Timers are kept in a deadline-ordered binary heap. Every start bumps the
//! timer's generation and pushes a fresh heap node; stopping only bumps the
//! generation, so the old node goes stale and is discarded lazily when it
//! reaches the top. This keeps start and stop at O(log n) and lets the loop
//! find the nearest deadline and the set of expired timers cheaply.
//!
//! Ties between equal deadlines are broken by start order.
//!
//! # Examples
//!
//! ```rust,no_run
//! use rust_evloop::Loop;
//! use std::time::Duration;
//!
//! let event_loop = Loop::new();
//! let timer = event_loop.timer(Duration::from_millis(100), false, || {
//!     println!("fired");
//!     Ok(())
//! });
//! assert!(timer.is_pending());
//! event_loop.run().unwrap();
//! ```

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

mod entry;

pub(crate) use entry::{deadline_after, Entry, TimerCallback};
pub use entry::TimerId;

use crate::event_loop::LoopInner;

/// Stale heap nodes tolerated beyond twice the live count before compacting.
const COMPACT_SLACK: usize = 16;

/// A heap node. Only `(deadline, seq)` take part in the ordering.
struct Node {
    deadline: Instant,
    seq: u64,
    generation: u64,
    entry: Rc<Entry>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Node {}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

impl Node {
    fn is_live(&self) -> bool {
        self.entry.pending.get() && self.entry.generation.get() == self.generation
    }
}

/// Deadline-ordered collection of one-shot and periodic timers.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<Node>>,
    /// Every pending timer, so `clear` can reach timers without a heap node.
    active: HashMap<TimerId, Rc<Entry>>,
    referenced: usize,
    next_id: u64,
    seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Creates a timer record without starting it.
    pub(crate) fn create(&mut self, interval: Duration, periodic: bool, callback: TimerCallback) -> Rc<Entry> {
        self.next_id += 1;
        Rc::new(Entry::new(TimerId(self.next_id), interval, periodic, callback))
    }

    /// Starts `entry` with a deadline of `now + interval`. No-op if pending.
    pub(crate) fn start(&mut self, entry: &Rc<Entry>, now: Instant) {
        if entry.pending.get() {
            return;
        }
        entry.pending.set(true);
        if entry.referenced.get() {
            self.referenced += 1;
        }
        self.active.insert(entry.id, Rc::clone(entry));
        self.schedule(entry, now);
    }

    /// Stops `entry`. No-op if not pending.
    pub(crate) fn stop(&mut self, entry: &Rc<Entry>) {
        if !entry.pending.get() {
            return;
        }
        entry.pending.set(false);
        entry.bump();
        if entry.referenced.get() {
            self.referenced -= 1;
        }
        self.active.remove(&entry.id);
    }

    pub(crate) fn reference(&mut self, entry: &Rc<Entry>) {
        if !entry.referenced.replace(true) && entry.pending.get() {
            self.referenced += 1;
        }
    }

    pub(crate) fn unreference(&mut self, entry: &Rc<Entry>) {
        if entry.referenced.replace(false) && entry.pending.get() {
            self.referenced -= 1;
        }
    }

    /// Number of pending timers.
    pub(crate) fn len(&self) -> usize {
        self.active.len()
    }

    /// True if no referenced timer is pending.
    pub(crate) fn is_empty(&self) -> bool {
        self.referenced == 0
    }

    /// Nearest deadline among pending timers, referenced or not.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_stale();
        self.heap.peek().map(|Reverse(node)| node.deadline)
    }

    /// Marks the current end of the start order. Timers started or rescheduled
    /// after the mark are not returned by [`pop_expired`](Self::pop_expired)
    /// with that mark, so each timer fires at most once per timer phase.
    pub(crate) fn mark(&self) -> u64 {
        self.seq
    }

    /// Takes the next timer whose deadline is at or before `cutoff` and that was
    /// scheduled before `mark`, nearest deadline first.
    ///
    /// A periodic timer is rescheduled to `now + interval`, measured from the
    /// firing instant; a one-shot timer stops. Either way the update happens
    /// before the caller runs the callback, so the callback sees the timer's
    /// next state and may stop or restart it.
    pub(crate) fn pop_expired(&mut self, cutoff: Instant, mark: u64, now: Instant) -> Option<Rc<Entry>> {
        loop {
            let Reverse(node) = self.heap.peek()?;
            if node.deadline > cutoff || node.seq > mark {
                return None;
            }
            let Reverse(node) = self.heap.pop()?;
            if !node.is_live() {
                continue;
            }
            if node.entry.periodic {
                self.schedule(&node.entry, now);
            } else {
                self.stop(&node.entry);
            }
            return Some(node.entry);
        }
    }

    /// Stops every pending timer.
    pub(crate) fn clear(&mut self) {
        let entries: Vec<Rc<Entry>> = self.active.values().cloned().collect();
        for entry in &entries {
            self.stop(entry);
        }
        self.heap.clear();
    }

    fn schedule(&mut self, entry: &Rc<Entry>, now: Instant) {
        let deadline = deadline_after(now, entry.interval);
        entry.deadline.set(deadline);
        let generation = entry.bump();
        self.seq += 1;
        self.heap.push(Reverse(Node {
            deadline,
            seq: self.seq,
            generation,
            entry: Rc::clone(entry),
        }));
        if self.heap.len() > 2 * self.active.len() + COMPACT_SLACK {
            self.heap.retain(|Reverse(node)| node.is_live());
        }
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse(node)) = self.heap.peek() {
            if node.is_live() {
                break;
            }
            self.heap.pop();
        }
    }
}

/// Handle to a timer registered with a loop.
///
/// Handles are cheap to clone; every clone controls the same timer. A handle
/// does not keep the loop alive: once the loop is dropped, `start` does nothing
/// and the timer reports not pending.
#[derive(Clone)]
pub struct Timer {
    entry: Rc<Entry>,
    owner: Weak<LoopInner>,
}

impl Timer {
    pub(crate) fn new(entry: Rc<Entry>, owner: Weak<LoopInner>) -> Self {
        Self { entry, owner }
    }

    pub fn id(&self) -> TimerId {
        self.entry.id
    }

    pub fn interval(&self) -> Duration {
        self.entry.interval
    }

    pub fn is_periodic(&self) -> bool {
        self.entry.periodic
    }

    /// True while the timer is scheduled to fire.
    pub fn is_pending(&self) -> bool {
        self.entry.pending.get()
    }

    /// The instant the timer fires next, if it is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.is_pending().then(|| self.entry.deadline.get())
    }

    /// Starts a stopped timer; its deadline is computed from now, not from the
    /// original schedule. Does nothing if the timer is already pending.
    pub fn start(&self) {
        if let Some(inner) = self.owner.upgrade() {
            inner.timers.borrow_mut().start(&self.entry, Instant::now());
        }
    }

    /// Stops the timer. A periodic timer stopping itself from its own callback
    /// does not fire again.
    pub fn stop(&self) {
        if let Some(inner) = self.owner.upgrade() {
            inner.timers.borrow_mut().stop(&self.entry);
        }
    }

    /// Makes the timer keep the loop non-empty (the default).
    pub fn reference(&self) {
        if let Some(inner) = self.owner.upgrade() {
            inner.timers.borrow_mut().reference(&self.entry);
        }
    }

    /// Lets the loop finish while the timer is pending. The timer still fires if
    /// the loop keeps running for other reasons.
    pub fn unreference(&self) {
        if let Some(inner) = self.owner.upgrade() {
            inner.timers.borrow_mut().unreference(&self.entry);
        }
    }

    pub fn is_referenced(&self) -> bool {
        self.entry.referenced.get()
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.entry.fmt(f)
    }
}
