//! Promises computed on first access.

use once_cell::unsync::OnceCell;
use std::cell::Cell;
use std::fmt;
use std::ops::Deref;

use super::{Promise, Resolution};
use crate::error::Error;
use crate::event_loop::Loop;
use crate::runtime_context;

type Promisor<T> = Box<dyn FnOnce() -> Resolution<T>>;

/// Defers creating a promise until something looks at it.
///
/// The promisor runs once, the first time the lazy promise is dereferenced,
/// chained or cancelled. Every later access sees the same promise.
///
/// ```rust,no_run
/// use rust_evloop::promise::{self, LazyPromise};
///
/// let lazy = LazyPromise::new(|| Ok(40 + 2));
/// assert!(!lazy.is_evaluated());
/// let answer = lazy.then(|v| Ok(v * 2));
/// assert_eq!(promise::wait(&answer).unwrap(), 84);
/// ```
pub struct LazyPromise<T> {
    promisor: Cell<Option<Promisor<T>>>,
    promise: OnceCell<Promise<T>>,
    event_loop: Loop,
}

impl<T: Clone + 'static> LazyPromise<T> {
    /// A lazy promise on the default loop.
    pub fn new<F, R>(promisor: F) -> Self
    where
        F: FnOnce() -> R + 'static,
        R: Into<Resolution<T>>,
    {
        Self::new_in(&runtime_context::default_loop(), promisor)
    }

    pub fn new_in<F, R>(event_loop: &Loop, promisor: F) -> Self
    where
        F: FnOnce() -> R + 'static,
        R: Into<Resolution<T>>,
    {
        Self {
            promisor: Cell::new(Some(Box::new(move || promisor().into()))),
            promise: OnceCell::new(),
            event_loop: event_loop.clone(),
        }
    }

    /// True once the promisor has run.
    pub fn is_evaluated(&self) -> bool {
        self.promise.get().is_some()
    }

    /// The underlying promise, running the promisor if needed.
    pub fn promise(&self) -> &Promise<T> {
        self.promise.get_or_init(|| {
            let resolution = match self.promisor.take() {
                Some(promisor) => promisor(),
                None => Resolution::Reject(Error::msg("lazy promise lost its promisor")),
            };
            Promise::from_resolution(self.event_loop.clone(), resolution)
        })
    }

    pub fn into_promise(self) -> Promise<T> {
        self.promise();
        match self.promise.into_inner() {
            Some(promise) => promise,
            None => Promise::rejected_in(&self.event_loop, Error::Unresolved),
        }
    }
}

impl<T: Clone + 'static> Deref for LazyPromise<T> {
    type Target = Promise<T>;

    fn deref(&self) -> &Promise<T> {
        self.promise()
    }
}

impl<T> fmt::Debug for LazyPromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyPromise")
            .field("evaluated", &self.promise.get().is_some())
            .finish()
    }
}
