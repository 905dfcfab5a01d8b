//! Store middleware.
//!
//! A middleware sees every candidate value on its way into a store, together
//! with the value it would replace and the store's name. It can pass the
//! candidate through, replace it, veto the write by returning the previous
//! value, or abort with an error. Middleware run in registration order and
//! each one receives the output of the one before it.

use std::fmt::Debug;

use tracing::debug;

use crate::error::Result;

/// A step in a store's write pipeline.
pub trait Middleware<T>: Send + Sync {
    fn apply(&self, next: T, previous: &T, store: &str) -> Result<T>;
}

impl<T, F> Middleware<T> for F
where
    F: Fn(T, &T, &str) -> Result<T> + Send + Sync,
{
    fn apply(&self, next: T, previous: &T, store: &str) -> Result<T> {
        self(next, previous, store)
    }
}

/// Vetoes writes whose candidate fails the predicate.
pub struct Validate<P> {
    predicate: P,
}

/// Keep the previous value whenever `predicate` rejects the candidate.
pub fn validate<T, P>(predicate: P) -> Validate<P>
where
    P: Fn(&T) -> bool + Send + Sync,
{
    Validate { predicate }
}

impl<T, P> Middleware<T> for Validate<P>
where
    T: Clone,
    P: Fn(&T) -> bool + Send + Sync,
{
    fn apply(&self, next: T, previous: &T, store: &str) -> Result<T> {
        if (self.predicate)(&next) {
            Ok(next)
        } else {
            debug!(store, "validation rejected candidate value");
            Ok(previous.clone())
        }
    }
}

/// Rewrites every candidate.
pub struct Map<F> {
    transform: F,
}

pub fn map<T, F>(transform: F) -> Map<F>
where
    F: Fn(T) -> T + Send + Sync,
{
    Map { transform }
}

impl<T, F> Middleware<T> for Map<F>
where
    F: Fn(T) -> T + Send + Sync,
{
    fn apply(&self, next: T, _previous: &T, _store: &str) -> Result<T> {
        Ok((self.transform)(next))
    }
}

/// Logs every write at debug level and passes it through.
#[derive(Debug, Default, Clone, Copy)]
pub struct Logger;

pub fn logger() -> Logger {
    Logger
}

impl<T: Debug> Middleware<T> for Logger {
    fn apply(&self, next: T, previous: &T, store: &str) -> Result<T> {
        debug!(store, ?previous, ?next, "store write");
        Ok(next)
    }
}

/// Thread `candidate` through `chain` in order.
pub(crate) fn run_chain<T>(
    chain: &[std::sync::Arc<dyn Middleware<T>>],
    candidate: T,
    previous: &T,
    store: &str,
) -> Result<T> {
    chain
        .iter()
        .try_fold(candidate, |next, middleware| middleware.apply(next, previous, store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StateError;
    use std::sync::Arc;

    #[test]
    fn validate_returns_previous_on_rejection() {
        let positive = validate(|n: &i32| *n > 0);
        assert_eq!(positive.apply(5, &1, "n").unwrap(), 5);
        assert_eq!(positive.apply(-5, &1, "n").unwrap(), 1);
    }

    #[test]
    fn chain_runs_in_registration_order() {
        let chain: Vec<Arc<dyn Middleware<i32>>> = vec![
            Arc::new(map(|n: i32| n + 1)),
            Arc::new(map(|n: i32| n * 10)),
            Arc::new(logger()),
        ];
        assert_eq!(run_chain(&chain, 1, &0, "n").unwrap(), 20);
    }

    #[test]
    fn closure_errors_stop_the_chain() {
        let reached = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = reached.clone();
        let chain: Vec<Arc<dyn Middleware<i32>>> = vec![
            Arc::new(|_next: i32, _prev: &i32, store: &str| -> Result<i32> {
                Err(StateError::middleware(store, "read-only"))
            }),
            Arc::new(move |next: i32, _prev: &i32, _store: &str| -> Result<i32> {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(next)
            }),
        ];

        let err = run_chain(&chain, 1, &0, "settings").unwrap_err();
        assert_eq!(err, StateError::middleware("settings", "read-only"));
        assert!(!reached.load(std::sync::atomic::Ordering::SeqCst));
    }
}
