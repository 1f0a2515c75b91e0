//! Promise engine
//!
//! A [`Promise`] starts pending and settles exactly once, either fulfilled
//! with a value or rejected with an [`Error`]. Continuations registered with
//! [`then`](Promise::then), [`catch`](Promise::catch) and friends never run
//! inline: when a promise settles, its whole continuation queue is moved into a
//! single callback on the loop's scheduler queue. The queues and the
//! cancellation handler are dropped at that moment, which also breaks the
//! reference cycles between a promise and the promises derived from it.
//!
//! Resolving a promise with another promise makes it follow that promise. A
//! chain of followers is collapsed on access, so looking up the terminal
//! promise stays cheap.
//!
//! ## Cancellation
//!
//! Cancelling a pending promise runs its cancellation handler and rejects it.
//! Promises created by `then`, `timeout` and `delay` count as children of the
//! promise they derive from. Cancelling a child only cancels the parent once
//! every child has been cancelled, so one consumer cannot cancel work other
//! consumers still wait for.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event_loop::Loop;
use crate::runtime_context;
use crate::timer::Timer;

mod combinators;
mod lazy;

pub use combinators::{map, reject, resolve, wait};
pub use lazy::LazyPromise;

type Continuation<V> = Box<dyn FnOnce(V) -> Result<()>>;
type CancelHandler = Box<dyn FnOnce(&Error) -> Result<()>>;

/// What a promise is settled with.
///
/// Handlers passed to [`Promise::then`] and [`Promise::catch`] may return a
/// `Result<T>` or a `Promise<T>`; both convert into a `Resolution`.
pub enum Resolution<T> {
    Fulfill(T),
    Adopt(Promise<T>),
    Reject(Error),
}

impl<T> From<Result<T>> for Resolution<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Resolution::Fulfill(value),
            Err(reason) => Resolution::Reject(reason),
        }
    }
}

impl<T> From<Promise<T>> for Resolution<T> {
    fn from(promise: Promise<T>) -> Self {
        Resolution::Adopt(promise)
    }
}

/// The terminal state of a settled promise.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Fulfilled(T),
    Rejected(Error),
}

impl<T> Outcome<T> {
    pub fn into_result(self) -> Result<T> {
        match self {
            Outcome::Fulfilled(value) => Ok(value),
            Outcome::Rejected(reason) => Err(reason),
        }
    }
}

struct Continuations<T> {
    on_fulfilled: Vec<Continuation<T>>,
    on_rejected: Vec<Continuation<Error>>,
    on_cancel: Option<CancelHandler>,
}

enum State<T> {
    Pending(Continuations<T>),
    /// Resolved with a promise that was still pending at the time.
    Following(Promise<T>),
    Fulfilled(T),
    Rejected(Error),
}

struct Inner<T> {
    state: RefCell<State<T>>,
    /// Derived promises that have not been cancelled.
    children: Cell<usize>,
    event_loop: Loop,
}

/// A value that becomes available later, or an error explaining why not.
///
/// Cloning a `Promise` yields another handle to the same promise.
pub struct Promise<T> {
    inner: Rc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// Settles the promise it was created for. Only the first call has any effect.
pub struct Resolver<T> {
    promise: Promise<T>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

impl<T: Clone + 'static> Resolver<T> {
    /// Fulfills the promise with `value`.
    pub fn resolve(&self, value: T) {
        self.promise.settle(Resolution::Fulfill(value));
    }

    /// Makes the promise follow `other`. Adopting the promise itself, directly
    /// or through a chain, rejects it with [`Error::TypeMismatch`].
    pub fn adopt(&self, other: Promise<T>) {
        self.promise.settle(Resolution::Adopt(other));
    }

    pub fn reject(&self, reason: Error) {
        self.promise.settle(Resolution::Reject(reason));
    }

    pub fn settle(&self, resolution: impl Into<Resolution<T>>) {
        self.promise.settle(resolution.into());
    }

    /// True until the promise has been resolved or rejected.
    pub fn is_pending(&self) -> bool {
        matches!(*self.promise.inner.state.borrow(), State::Pending(_))
    }
}

impl<T: Clone + 'static> Promise<T> {
    /// Creates a promise on the default loop. `resolver` receives the handle
    /// that settles it; returning an error rejects the promise.
    pub fn new<F>(resolver: F) -> Self
    where
        F: FnOnce(Resolver<T>) -> Result<()>,
    {
        Self::build(runtime_context::default_loop(), resolver, None)
    }

    /// Like [`new`](Self::new), running `on_cancel` when the promise is
    /// cancelled while pending. The promise is rejected afterwards with the
    /// cancellation reason, or with the error `on_cancel` returns.
    pub fn with_canceller<F, C>(resolver: F, on_cancel: C) -> Self
    where
        F: FnOnce(Resolver<T>) -> Result<()>,
        C: FnOnce(&Error) -> Result<()> + 'static,
    {
        Self::build(runtime_context::default_loop(), resolver, Some(Box::new(on_cancel)))
    }

    /// Creates a promise whose continuations run on `event_loop`.
    pub fn new_in<F>(event_loop: &Loop, resolver: F) -> Self
    where
        F: FnOnce(Resolver<T>) -> Result<()>,
    {
        Self::build(event_loop.clone(), resolver, None)
    }

    pub fn with_canceller_in<F, C>(event_loop: &Loop, resolver: F, on_cancel: C) -> Self
    where
        F: FnOnce(Resolver<T>) -> Result<()>,
        C: FnOnce(&Error) -> Result<()> + 'static,
    {
        Self::build(event_loop.clone(), resolver, Some(Box::new(on_cancel)))
    }

    /// An already fulfilled promise on the default loop.
    pub fn resolved(value: T) -> Self {
        Self::resolved_in(&runtime_context::default_loop(), value)
    }

    /// An already rejected promise on the default loop.
    pub fn rejected(reason: Error) -> Self {
        Self::rejected_in(&runtime_context::default_loop(), reason)
    }

    pub fn resolved_in(event_loop: &Loop, value: T) -> Self {
        Self::with_state(event_loop.clone(), State::Fulfilled(value))
    }

    pub fn rejected_in(event_loop: &Loop, reason: Error) -> Self {
        Self::with_state(event_loop.clone(), State::Rejected(reason))
    }

    /// The loop this promise schedules its continuations on.
    pub fn event_loop(&self) -> &Loop {
        &self.inner.event_loop
    }

    fn build<F>(event_loop: Loop, resolver: F, on_cancel: Option<CancelHandler>) -> Self
    where
        F: FnOnce(Resolver<T>) -> Result<()>,
    {
        let (promise, handle) = Self::pending(event_loop, on_cancel);
        if let Err(reason) = resolver(handle.clone()) {
            handle.reject(reason);
        }
        promise
    }

    fn with_state(event_loop: Loop, state: State<T>) -> Self {
        Self {
            inner: Rc::new(Inner {
                state: RefCell::new(state),
                children: Cell::new(0),
                event_loop,
            }),
        }
    }

    pub(crate) fn pending(event_loop: Loop, on_cancel: Option<CancelHandler>) -> (Self, Resolver<T>) {
        let promise = Self::with_state(
            event_loop,
            State::Pending(Continuations {
                on_fulfilled: Vec::new(),
                on_rejected: Vec::new(),
                on_cancel,
            }),
        );
        let resolver = Resolver {
            promise: promise.clone(),
        };
        (promise, resolver)
    }

    pub(crate) fn from_resolution(event_loop: Loop, resolution: Resolution<T>) -> Self {
        let (promise, resolver) = Self::pending(event_loop, None);
        resolver.settle(resolution);
        promise
    }

    pub fn is_pending(&self) -> bool {
        self.inspect(|state| matches!(state, State::Pending(_)))
    }

    pub fn is_fulfilled(&self) -> bool {
        self.inspect(|state| matches!(state, State::Fulfilled(_)))
    }

    pub fn is_rejected(&self) -> bool {
        self.inspect(|state| matches!(state, State::Rejected(_)))
    }

    /// The settled outcome. Fails with [`Error::Unresolved`] while pending.
    pub fn result(&self) -> Result<Outcome<T>> {
        self.inspect(|state| match state {
            State::Fulfilled(value) => Ok(Outcome::Fulfilled(value.clone())),
            State::Rejected(reason) => Ok(Outcome::Rejected(reason.clone())),
            _ => Err(Error::Unresolved),
        })
    }

    /// Derives a promise settled by `on_fulfilled`'s return value once this one
    /// fulfils. A rejection is passed through unchanged.
    pub fn then<U, F, R>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> R + 'static,
        R: Into<Resolution<U>>,
    {
        self.derive(Box::new(move |value| on_fulfilled(value).into()), None)
    }

    /// Derives a promise that recovers from a rejection through `on_rejected`.
    /// A fulfilment is passed through unchanged.
    pub fn catch<F, R>(&self, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(Error) -> R + 'static,
        R: Into<Resolution<T>>,
    {
        self.derive(
            Box::new(Resolution::Fulfill),
            Some(Box::new(move |reason| on_rejected(reason).into())),
        )
    }

    /// [`then`](Self::then) and [`catch`](Self::catch) in one step.
    pub fn then_with<U, F, G, R, S>(&self, on_fulfilled: F, on_rejected: G) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> R + 'static,
        G: FnOnce(Error) -> S + 'static,
        R: Into<Resolution<U>>,
        S: Into<Resolution<U>>,
    {
        self.derive(
            Box::new(move |value| on_fulfilled(value).into()),
            Some(Box::new(move |reason| on_rejected(reason).into())),
        )
    }

    /// Terminal consumer. An error returned by `on_fulfilled`, or a rejection of
    /// this promise, is returned from the loop's `tick`/`run` instead of being
    /// dropped.
    pub fn done<F>(&self, on_fulfilled: F)
    where
        F: FnOnce(T) -> Result<()> + 'static,
    {
        self.register(Box::new(on_fulfilled), Box::new(Err::<(), Error>));
    }

    /// Terminal consumer with a rejection handler.
    pub fn done_with<F, G>(&self, on_fulfilled: F, on_rejected: G)
    where
        F: FnOnce(T) -> Result<()> + 'static,
        G: FnOnce(Error) -> Result<()> + 'static,
    {
        self.register(Box::new(on_fulfilled), Box::new(on_rejected));
    }

    /// Cancels a pending promise; `None` uses [`Error::Cancelled`] as reason.
    ///
    /// A following promise forwards the cancellation to the promise it follows.
    /// Cancelling a settled promise does nothing.
    pub fn cancel(&self, reason: Option<Error>) {
        enum Step<T> {
            Run(Option<CancelHandler>),
            Forward(Promise<T>),
        }

        let reason = reason.unwrap_or(Error::Cancelled(None));
        let step = {
            let mut state = self.inner.state.borrow_mut();
            match &mut *state {
                State::Pending(continuations) => Step::Run(continuations.on_cancel.take()),
                State::Following(target) => Step::Forward(target.clone()),
                State::Fulfilled(_) | State::Rejected(_) => return,
            }
        };

        match step {
            Step::Forward(target) => target.cancel(Some(reason)),
            Step::Run(handler) => {
                let reason = match handler.map(|handler| handler(&reason)) {
                    Some(Err(replacement)) => replacement,
                    _ => reason,
                };
                self.complete(Err(reason));
            }
        }
    }

    /// Derives a promise that is cancelled with `reason` (default
    /// [`Error::TimedOut`]) unless this promise settles within `after`.
    ///
    /// Returns the terminal promise itself if it is already settled.
    pub fn timeout(&self, after: Duration, reason: Option<Error>) -> Promise<T> {
        let parent = self.terminal();
        if !parent.is_pending() {
            return parent;
        }

        let slot: Rc<RefCell<Option<Timer>>> = Rc::default();
        let stop = stopper(&slot);
        let (derived, resolver) = parent.child(Some(Box::new(stop.clone())));

        let reason = reason.unwrap_or(Error::TimedOut(None));
        let expired = Rc::downgrade(&derived.inner);
        let watched = Rc::downgrade(&parent.inner);
        let timer = parent.inner.event_loop.timer(after, false, move || {
            // The parent may have settled with its continuations still queued.
            let settled = Weak::upgrade(&watched)
                .map_or(false, |inner| !Promise { inner }.terminal().is_pending());
            if settled {
                return Ok(());
            }
            if let Some(inner) = Weak::upgrade(&expired) {
                tracing::trace!("promise timed out after {:?}", after);
                Promise { inner }.cancel(Some(reason.clone()));
            }
            Ok(())
        });
        *slot.borrow_mut() = Some(timer);

        let on_rejected = resolver.clone();
        let stop_rejected = stop.clone();
        parent.register(
            Box::new(move |value| {
                stop();
                resolver.resolve(value);
                Ok(())
            }),
            Box::new(move |reason| {
                stop_rejected();
                on_rejected.reject(reason);
                Ok(())
            }),
        );
        derived
    }

    /// Derives a promise that fulfils with this promise's value `after` it was
    /// fulfilled. Rejections pass through without delay.
    pub fn delay(&self, after: Duration) -> Promise<T> {
        let parent = self.terminal();
        if parent.is_rejected() {
            return parent;
        }

        let slot: Rc<RefCell<Option<Timer>>> = Rc::default();
        let (derived, resolver) = parent.child(Some(Box::new(stopper(&slot))));

        let event_loop = parent.inner.event_loop.clone();
        let on_rejected = resolver.clone();
        parent.register(
            Box::new(move |value| {
                let mut value = Some(value);
                let timer = event_loop.timer(after, false, move || {
                    if let Some(value) = value.take() {
                        resolver.resolve(value);
                    }
                    Ok(())
                });
                *slot.borrow_mut() = Some(timer);
                Ok(())
            }),
            Box::new(move |reason| {
                on_rejected.reject(reason);
                Ok(())
            }),
        );
        derived
    }

    fn settle(&self, resolution: Resolution<T>) {
        if !matches!(*self.inner.state.borrow(), State::Pending(_)) {
            return;
        }
        match resolution {
            Resolution::Fulfill(value) => self.complete(Ok(value)),
            Resolution::Reject(reason) => self.complete(Err(reason)),
            Resolution::Adopt(other) => {
                let target = other.terminal();
                if Rc::ptr_eq(&target.inner, &self.inner) {
                    self.complete(Err(Error::TypeMismatch(
                        "circular reference in promise resolution".into(),
                    )));
                    return;
                }
                match target.result() {
                    Ok(outcome) => self.complete(outcome.into_result()),
                    Err(_) => self.follow(target),
                }
            }
        }
    }

    /// Moves from pending to `next`, handing back the continuations.
    fn transition(&self, next: State<T>) -> Option<Continuations<T>> {
        let mut state = self.inner.state.borrow_mut();
        if !matches!(*state, State::Pending(_)) {
            return None;
        }
        match std::mem::replace(&mut *state, next) {
            State::Pending(continuations) => Some(continuations),
            _ => None,
        }
    }

    fn complete(&self, result: Result<T>) {
        let next = match &result {
            Ok(value) => State::Fulfilled(value.clone()),
            Err(reason) => State::Rejected(reason.clone()),
        };
        let Some(continuations) = self.transition(next) else {
            return;
        };
        let Continuations {
            on_fulfilled,
            on_rejected,
            ..
        } = continuations;

        match result {
            Ok(value) => self.dispatch(on_fulfilled, value),
            Err(reason) => self.dispatch(on_rejected, reason),
        }
    }

    /// Hands the queued continuations over to a still pending `target`.
    fn follow(&self, target: Promise<T>) {
        let Some(continuations) = self.transition(State::Following(target.clone())) else {
            return;
        };
        let Continuations {
            on_fulfilled,
            on_rejected,
            ..
        } = continuations;
        if on_fulfilled.is_empty() && on_rejected.is_empty() {
            return;
        }
        target.register(
            Box::new(move |value| run_all(on_fulfilled, value)),
            Box::new(move |reason| run_all(on_rejected, reason)),
        );
    }

    fn dispatch<V: Clone + 'static>(&self, queue: Vec<Continuation<V>>, value: V) {
        if queue.is_empty() {
            return;
        }
        self.inner.event_loop.schedule(move || run_all(queue, value));
    }

    /// Queues a continuation pair on the terminal promise, or schedules the
    /// matching one right away if it has settled.
    fn register(&self, on_fulfilled: Continuation<T>, on_rejected: Continuation<Error>) {
        let target = self.terminal();
        let mut state = target.inner.state.borrow_mut();
        match &mut *state {
            State::Pending(continuations) => {
                continuations.on_fulfilled.push(on_fulfilled);
                continuations.on_rejected.push(on_rejected);
            }
            State::Following(next) => {
                let next = next.clone();
                drop(state);
                next.register(on_fulfilled, on_rejected);
            }
            State::Fulfilled(value) => {
                let value = value.clone();
                drop(state);
                target.inner.event_loop.schedule(move || on_fulfilled(value));
            }
            State::Rejected(reason) => {
                let reason = reason.clone();
                drop(state);
                target.inner.event_loop.schedule(move || on_rejected(reason));
            }
        }
    }

    fn derive<U: Clone + 'static>(
        &self,
        on_fulfilled: Box<dyn FnOnce(T) -> Resolution<U>>,
        on_rejected: Option<Box<dyn FnOnce(Error) -> Resolution<U>>>,
    ) -> Promise<U> {
        let parent = self.terminal();
        if on_rejected.is_none() {
            if let Ok(Outcome::Rejected(reason)) = parent.result() {
                return Promise::rejected_in(&parent.inner.event_loop, reason);
            }
        }

        let (derived, resolver) = parent.child(None);
        let on_fulfilled_resolver = resolver.clone();
        parent.register(
            Box::new(move |value| {
                on_fulfilled_resolver.settle(on_fulfilled(value));
                Ok(())
            }),
            Box::new(move |reason| {
                match on_rejected {
                    Some(handler) => resolver.settle(handler(reason)),
                    None => resolver.reject(reason),
                }
                Ok(())
            }),
        );
        derived
    }

    /// Creates a pending child whose cancellation runs `before_release` and
    /// then gives up this promise's claim on the child.
    fn child<U: Clone + 'static>(&self, before_release: Option<Box<dyn FnOnce()>>) -> (Promise<U>, Resolver<U>) {
        self.inner.children.set(self.inner.children.get() + 1);
        let parent = self.clone();
        Promise::pending(
            self.inner.event_loop.clone(),
            Some(Box::new(move |reason: &Error| {
                if let Some(before_release) = before_release {
                    before_release();
                }
                parent.release_child(reason);
                Ok(())
            })),
        )
    }

    fn release_child(&self, reason: &Error) {
        let left = self.inner.children.get().saturating_sub(1);
        self.inner.children.set(left);
        if left == 0 {
            self.cancel(Some(reason.clone()));
        }
    }

    /// The promise at the end of the follow chain. Intermediate links are
    /// repointed at it.
    fn terminal(&self) -> Promise<T> {
        let mut current = self.clone();
        loop {
            let next = match &*current.inner.state.borrow() {
                State::Following(next) => next.clone(),
                _ => break,
            };
            current = next;
        }
        if !Rc::ptr_eq(&current.inner, &self.inner) {
            if let State::Following(next) = &mut *self.inner.state.borrow_mut() {
                *next = current.clone();
            }
        }
        current
    }

    fn inspect<R>(&self, f: impl FnOnce(&State<T>) -> R) -> R {
        let target = self.terminal();
        let state = target.inner.state.borrow();
        let result = f(&state);
        result
    }

    #[cfg(test)]
    fn children(&self) -> usize {
        self.inner.children.get()
    }
}

/// A closure stopping the timer in `slot`, if any.
fn stopper(slot: &Rc<RefCell<Option<Timer>>>) -> impl Fn() + Clone + 'static {
    let slot = Rc::clone(slot);
    move || {
        if let Some(timer) = slot.borrow_mut().take() {
            timer.stop();
        }
    }
}

/// Runs every continuation, returning the first error.
fn run_all<V: Clone>(queue: Vec<Continuation<V>>, value: V) -> Result<()> {
    let mut first_error = None;
    for continuation in queue {
        if let Err(e) = continuation(value.clone()) {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

impl<T: Clone + 'static> From<T> for Promise<T> {
    fn from(value: T) -> Self {
        Promise::resolved(value)
    }
}

impl<T: Clone + fmt::Debug + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inspect(|state| match state {
            State::Fulfilled(value) => f.debug_tuple("Promise::Fulfilled").field(value).finish(),
            State::Rejected(reason) => f.debug_tuple("Promise::Rejected").field(reason).finish(),
            _ => f.write_str("Promise::Pending"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoopConfig;

    fn test_loop() -> Loop {
        Loop::with_config(LoopConfig::new().signals(false)).unwrap()
    }

    fn deferred<T: Clone + 'static>(event_loop: &Loop) -> (Promise<T>, Resolver<T>) {
        Promise::pending(event_loop.clone(), None)
    }

    fn rejection<T: Clone + 'static>(promise: &Promise<T>) -> Error {
        match promise.result() {
            Ok(Outcome::Rejected(reason)) => reason,
            _ => panic!("promise is not rejected"),
        }
    }

    fn value<T: Clone + 'static>(promise: &Promise<T>) -> T {
        match promise.result() {
            Ok(Outcome::Fulfilled(value)) => value,
            _ => panic!("promise is not fulfilled"),
        }
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let l = test_loop();
        let (promise, resolver) = deferred(&l);
        assert!(matches!(promise.result(), Err(Error::Unresolved)));

        resolver.resolve(1);
        resolver.resolve(2);
        resolver.reject(Error::msg("late"));
        assert!(promise.is_fulfilled());
        assert_eq!(value(&promise), 1);
    }

    #[test]
    fn test_resolver_error_rejects() {
        let l = test_loop();
        let promise: Promise<i32> = Promise::new_in(&l, |_| Err(Error::msg("failed")));
        assert!(matches!(rejection(&promise), Error::Message(m) if m == "failed"));
    }

    #[test]
    fn test_self_resolution_is_type_mismatch() {
        let l = test_loop();
        let (promise, resolver) = deferred::<i32>(&l);
        resolver.adopt(promise.clone());
        assert!(matches!(rejection(&promise), Error::TypeMismatch(_)));
    }

    #[test]
    fn test_indirect_cycle_is_type_mismatch() {
        let l = test_loop();
        let (a, resolve_a) = deferred::<i32>(&l);
        let (b, resolve_b) = deferred::<i32>(&l);
        resolve_a.adopt(b.clone());
        resolve_b.adopt(a.clone());
        assert!(a.is_rejected() && b.is_rejected());
        assert!(matches!(rejection(&b), Error::TypeMismatch(_)));
    }

    #[test]
    fn test_adoption_follows_chain() {
        let l = test_loop();
        let (a, resolve_a) = deferred::<&str>(&l);
        let (b, resolve_b) = deferred::<&str>(&l);
        let (c, resolve_c) = deferred::<&str>(&l);
        resolve_b.adopt(a.clone());
        resolve_c.adopt(b.clone());
        assert!(c.is_pending());

        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        c.done(move |v| {
            *s.borrow_mut() = Some(v);
            Ok(())
        });

        resolve_a.resolve("done");
        assert!(b.is_fulfilled() && c.is_fulfilled());
        assert!(seen.borrow().is_none());
        l.run().unwrap();
        assert_eq!(*seen.borrow(), Some("done"));
    }

    #[test]
    fn test_adopting_settled_promise_copies_state() {
        let l = test_loop();
        let (promise, resolver) = deferred::<i32>(&l);
        resolver.adopt(Promise::resolved_in(&l, 9));
        assert_eq!(value(&promise), 9);
    }

    #[test]
    fn test_then_runs_asynchronously() {
        let l = test_loop();
        let calls = Rc::new(Cell::new(0));
        let c = calls.clone();
        let derived = Promise::resolved_in(&l, 1).then(move |v| {
            c.set(c.get() + 1);
            Ok(v * 10)
        });
        assert_eq!(calls.get(), 0);
        assert!(derived.is_pending());

        l.tick(false).unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(value(&derived), 10);
    }

    #[test]
    fn test_then_on_rejected_without_handler_is_rejected_now() {
        let l = test_loop();
        let parent: Promise<i32> = Promise::rejected_in(&l, Error::msg("nope"));
        let derived = parent.then(|v| Ok(v + 1));
        assert!(derived.is_rejected());
        assert!(l.is_empty());
    }

    #[test]
    fn test_handler_error_rejects_and_catch_recovers() {
        let l = test_loop();
        let (parent, resolver) = deferred::<i32>(&l);
        let failed = parent.then(|_| Err::<i32, _>(Error::msg("handler")));
        let recovered = failed.catch(|reason| {
            assert!(matches!(reason, Error::Message(_)));
            Ok(-1)
        });

        resolver.resolve(5);
        l.run().unwrap();
        assert!(failed.is_rejected());
        assert_eq!(value(&recovered), -1);
    }

    #[test]
    fn test_handler_returning_promise_is_adopted() {
        let l = test_loop();
        let (inner, resolve_inner) = deferred::<String>(&l);
        let i = inner.clone();
        let outer = Promise::resolved_in(&l, 1).then(move |_| i);
        l.run().unwrap();
        assert!(outer.is_pending());

        resolve_inner.resolve("later".to_string());
        assert_eq!(value(&outer), "later");
    }

    #[test]
    fn test_cancel_default_and_custom_handlers() {
        let l = test_loop();
        let (plain, _r) = deferred::<i32>(&l);
        plain.cancel(None);
        assert!(rejection(&plain).is_cancelled());

        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        let custom: Promise<i32> = Promise::with_canceller_in(
            &l,
            |_| Ok(()),
            move |reason| {
                assert!(reason.is_cancelled());
                r.set(true);
                Err(Error::msg("replaced"))
            },
        );
        custom.cancel(None);
        assert!(ran.get());
        assert!(matches!(rejection(&custom), Error::Message(m) if m == "replaced"));

        // Settled promises ignore cancellation.
        let settled = Promise::resolved_in(&l, 3);
        settled.cancel(None);
        assert!(settled.is_fulfilled());
    }

    #[test]
    fn test_parent_cancelled_only_after_all_children() {
        let l = test_loop();
        let (parent, _r) = deferred::<i32>(&l);
        let first = parent.then(|v| Ok(v));
        let second = parent.then(|v| Ok(v));
        assert_eq!(parent.children(), 2);

        first.cancel(None);
        assert!(first.is_rejected());
        assert!(parent.is_pending());
        assert!(second.is_pending());

        second.cancel(None);
        assert!(parent.is_rejected());
        assert!(rejection(&parent).is_cancelled());
    }

    #[test]
    fn test_cancel_following_promise_forwards() {
        let l = test_loop();
        let (target, _r) = deferred::<i32>(&l);
        let (follower, resolver) = deferred::<i32>(&l);
        resolver.adopt(target.clone());
        follower.cancel(None);
        assert!(target.is_rejected());
        assert!(follower.is_rejected());
    }

    #[test]
    fn test_timeout_cancels_with_timed_out() {
        let l = test_loop();
        let (parent, _r) = deferred::<i32>(&l);
        let limited = parent.timeout(Duration::from_millis(5), None);
        l.run().unwrap();
        assert!(rejection(&limited).is_timed_out());
        assert!(rejection(&parent).is_timed_out());
    }

    #[test]
    fn test_timeout_timer_stops_on_settlement() {
        let l = test_loop();
        let (parent, resolver) = deferred::<i32>(&l);
        let limited = parent.timeout(Duration::from_secs(60), None);
        assert!(!l.is_empty());

        resolver.resolve(4);
        let start = std::time::Instant::now();
        l.run().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(value(&limited), 4);
    }

    #[test]
    fn test_timeout_loses_to_settlement_made_before_expiry() {
        let l = test_loop();
        let (parent, resolver) = deferred::<i32>(&l);
        let limited = parent.timeout(Duration::from_millis(10), None);

        resolver.resolve(7);
        std::thread::sleep(Duration::from_millis(20));
        l.run().unwrap();
        assert_eq!(value(&limited), 7);
    }

    #[test]
    fn test_delay_waits_and_passes_rejections() {
        let l = test_loop();
        let start = std::time::Instant::now();
        let delayed = Promise::resolved_in(&l, 7).delay(Duration::from_millis(20));
        l.run().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(value(&delayed), 7);

        let rejected: Promise<i32> = Promise::rejected_in(&l, Error::msg("x"));
        assert!(rejected.delay(Duration::from_secs(60)).is_rejected());
        assert!(l.is_empty());
    }

    #[test]
    fn test_cancel_delay_stops_timer() {
        let l = test_loop();
        let (parent, resolver) = deferred::<i32>(&l);
        let delayed = parent.delay(Duration::from_secs(60));
        resolver.resolve(1);
        l.tick(false).unwrap();
        assert!(!l.is_empty());

        delayed.cancel(None);
        assert!(delayed.is_rejected());
        assert!(l.is_empty());
    }

    #[test]
    fn test_done_reraises_unhandled_rejection() {
        let l = test_loop();
        let promise: Promise<i32> = Promise::rejected_in(&l, Error::msg("lost"));
        promise.done(|_| Ok(()));
        let err = l.tick(false).unwrap_err();
        assert!(matches!(err, Error::Message(m) if m == "lost"));
    }

    #[test]
    fn test_done_with_handles_rejection() {
        let l = test_loop();
        let handled = Rc::new(Cell::new(false));
        let h = handled.clone();
        let promise: Promise<i32> = Promise::rejected_in(&l, Error::msg("seen"));
        promise.done_with(
            |_| Ok(()),
            move |_| {
                h.set(true);
                Ok(())
            },
        );
        l.tick(false).unwrap();
        assert!(handled.get());
    }
}
