//! Free-standing helpers over promises.

use std::rc::Rc;

use super::{Promise, Resolution};
use crate::error::{Error, Result};

/// A fulfilled promise on the default loop.
pub fn resolve<T: Clone + 'static>(value: T) -> Promise<T> {
    Promise::resolved(value)
}

/// A rejected promise on the default loop.
pub fn reject<T: Clone + 'static>(reason: Error) -> Promise<T> {
    Promise::rejected(reason)
}

/// Applies `f` to every item once it is available. Plain values are wrapped in
/// fulfilled promises first; the output keeps the input order.
///
/// ```rust,no_run
/// use rust_evloop::promise::{self, Promise};
///
/// let doubled = promise::map(|x: i32| Ok(x * 2), vec![Promise::resolved(1), Promise::resolved(2)]);
/// assert_eq!(promise::wait(&doubled[1]).unwrap(), 4);
/// ```
pub fn map<T, U, F, R, I>(f: F, items: I) -> Vec<Promise<U>>
where
    T: Clone + 'static,
    U: Clone + 'static,
    F: Fn(T) -> R + 'static,
    R: Into<Resolution<U>>,
    I: IntoIterator,
    I::Item: Into<Promise<T>>,
{
    let f = Rc::new(f);
    items
        .into_iter()
        .map(|item| {
            let f = Rc::clone(&f);
            item.into().then(move |value| f(value))
        })
        .collect()
}

/// Ticks the promise's loop until the promise settles.
///
/// Returns the fulfilment value or the rejection reason. Fails with
/// [`Error::Unresolved`] if the loop runs out of work first, since nothing
/// could settle the promise anymore.
pub fn wait<T: Clone + 'static>(promise: &Promise<T>) -> Result<T> {
    let event_loop = promise.event_loop().clone();
    while promise.is_pending() {
        if event_loop.is_empty() {
            tracing::debug!("loop ran out of work before the promise settled");
            return Err(Error::Unresolved);
        }
        event_loop.tick(true)?;
    }
    promise.result()?.into_result()
}
