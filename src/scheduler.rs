//! Scheduler (microtask) queue
//!
//! Strict FIFO queue of one-shot callbacks, drained once per tick up to a
//! configurable depth. Callbacks scheduled while the queue drains are appended
//! and run later in the same drain if the depth budget allows, otherwise on the
//! next tick. Nothing is ever invoked inline by `schedule`.

use std::collections::VecDeque;

use crate::config::DEFAULT_MAX_SCHEDULE_DEPTH;
use crate::error::Result;
use crate::event_loop::LoopInner;

pub(crate) type Task = Box<dyn FnOnce() -> Result<()>>;

pub(crate) struct Scheduler {
    queue: VecDeque<Task>,
    max_depth: usize,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::with_depth(DEFAULT_MAX_SCHEDULE_DEPTH)
    }
}

impl Scheduler {
    pub(crate) fn with_depth(max_depth: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            max_depth: max_depth.max(1),
        }
    }

    pub(crate) fn push(&mut self, task: Task) {
        self.queue.push_back(task);
    }

    pub(crate) fn pop(&mut self) -> Option<Task> {
        self.queue.pop_front()
    }

    pub(crate) fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Sets the drain depth (at least 1) and returns the previous one.
    pub(crate) fn set_max_depth(&mut self, depth: usize) -> usize {
        std::mem::replace(&mut self.max_depth, depth.max(1))
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Runs up to `max_depth` queued tasks. Returns how many ran.
///
/// The queue is borrowed only to pop each task, so tasks may schedule more.
pub(crate) fn drain(inner: &LoopInner) -> Result<usize> {
    let depth = inner.scheduler.borrow().max_depth();
    let mut ran = 0;
    while ran < depth {
        let Some(task) = inner.scheduler.borrow_mut().pop() else {
            break;
        };
        ran += 1;
        task()?;
    }
    if ran > 0 {
        tracing::trace!("drained {} scheduled callbacks", ran);
    }
    Ok(ran)
}
