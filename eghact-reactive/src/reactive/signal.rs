//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive: a value, a version
//! counter, and the units that depend on it.
//!
//! # How Signals Work
//!
//! 1. When a signal is read within an evaluation context (computed/effect),
//!    the read is recorded together with the version that was observed.
//!
//! 2. When a write changes the value (per the signal's [`Equality`]), the
//!    version is bumped, observers are marked maybe-dirty, and subscribers
//!    are called with the new value, oldest first.
//!
//! 3. A write issued while another write is propagating (e.g. from a
//!    subscriber callback) is queued and applied once the current pass has
//!    finished notifying.
//!
//! # Memory Layout
//!
//! Each signal consists of:
//! - A unique ID (8 bytes)
//! - The value and version, behind one lock so they are always read together
//! - The observer set (computeds/effects) and the subscriber list (callbacks)

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::trace;

use super::runtime::{Dependency, ObserverSet, Reactive, Runtime, Source};
use super::subscriber::{SubscriberId, SubscriberList, Subscription};
use crate::error::Result;

/// Counter for generating unique source IDs (signals and computeds share it).
static SOURCE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a new unique source ID.
pub(crate) fn next_source_id() -> u64 {
    SOURCE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Decides whether a write actually changes a signal.
pub struct Equality<T> {
    eq: Option<Arc<dyn Fn(&T, &T) -> bool + Send + Sync>>,
}

impl<T> Equality<T> {
    /// Compare with `PartialEq`. The default for [`Signal::new`].
    pub fn partial_eq() -> Self
    where
        T: PartialEq,
    {
        Self {
            eq: Some(Arc::new(|a: &T, b: &T| a == b)),
        }
    }

    /// Treat every write as a change.
    pub fn never() -> Self {
        Self { eq: None }
    }

    /// Compare with a custom function (e.g. by key or by pointer).
    pub fn by<F>(eq: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self {
            eq: Some(Arc::new(eq)),
        }
    }

    pub(crate) fn same(&self, a: &T, b: &T) -> bool {
        self.eq.as_ref().is_some_and(|eq| eq(a, b))
    }
}

impl<T> Clone for Equality<T> {
    fn clone(&self) -> Self {
        Self {
            eq: self.eq.clone(),
        }
    }
}

struct Cell<T> {
    value: T,
    version: u64,
}

pub(crate) struct SignalInner<T> {
    id: u64,
    runtime: Runtime,
    cell: RwLock<Cell<T>>,
    equality: Equality<T>,
    observers: ObserverSet,
    subscribers: SubscriberList<T>,
}

impl<T> SignalInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Apply a write immediately. Returns whether the value changed.
    ///
    /// `min_version` lets hydration adopt a version from a snapshot; the
    /// counter still moves forward by at least one.
    pub(crate) fn write_now(&self, value: T, min_version: u64) -> bool {
        let (current, version) = {
            let mut cell = self.cell.write();
            if self.equality.same(&cell.value, &value) {
                trace!(signal = self.id, "write skipped: value unchanged");
                return false;
            }
            cell.value = value;
            cell.version = (cell.version + 1).max(min_version);
            (cell.value.clone(), cell.version)
        };

        trace!(signal = self.id, version, "signal written");
        self.observers.notify();
        self.subscribers.dispatch(&current);
        true
    }

    /// Raise the version to at least `min_version` without touching the
    /// value or notifying anyone. Returns whether the version moved.
    pub(crate) fn adopt_version(&self, min_version: u64) -> bool {
        let mut cell = self.cell.write();
        if cell.version >= min_version {
            return false;
        }
        cell.version = min_version;
        trace!(signal = self.id, version = min_version, "version adopted");
        true
    }
}

impl<T> Source for SignalInner<T>
where
    T: Send + Sync + 'static,
{
    fn source_id(&self) -> u64 {
        self.id
    }

    fn current_version(&self) -> Result<u64> {
        Ok(self.cell.read().version)
    }

    fn add_observer(&self, observer: Weak<dyn Reactive>) {
        self.observers.add(observer);
    }

    fn remove_observer(&self, id: SubscriberId) {
        self.observers.remove(id);
    }
}

/// A reactive signal holding a value of type T.
///
/// # Example
///
/// ```rust
/// use eghact_reactive::reactive::{Runtime, Signal};
///
/// let rt = Runtime::new();
/// let count = Signal::new(&rt, 0);
///
/// count.set(5);
/// assert_eq!(count.get(), 5);
/// assert_eq!(count.version(), 1);
///
/// // Equal writes are no-ops.
/// count.set(5);
/// assert_eq!(count.version(), 1);
/// ```
pub struct Signal<T> {
    inner: Arc<SignalInner<T>>,
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new signal that compares writes with `PartialEq`.
    pub fn new(runtime: &Runtime, value: T) -> Self
    where
        T: PartialEq,
    {
        Self::with_equality(runtime, value, Equality::partial_eq())
    }

    /// Create a new signal with a custom equality check.
    pub fn with_equality(runtime: &Runtime, value: T, equality: Equality<T>) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                id: next_source_id(),
                runtime: runtime.clone(),
                cell: RwLock::new(Cell { value, version: 0 }),
                equality,
                observers: ObserverSet::new(),
                subscribers: SubscriberList::new(),
            }),
        }
    }

    /// Get the signal's unique ID.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// Number of writes that changed the value.
    pub fn version(&self) -> u64 {
        self.inner.cell.read().version
    }

    /// Get the current value.
    ///
    /// Inside an evaluation context this also records the signal as a
    /// dependency of the running computation.
    pub fn get(&self) -> T {
        let (value, version) = {
            let cell = self.inner.cell.read();
            (cell.value.clone(), cell.version)
        };
        self.track(version);
        value
    }

    /// Get the current value without tracking dependencies.
    pub fn get_untracked(&self) -> T {
        self.inner.cell.read().value.clone()
    }

    /// Borrow the current value (tracked) without cloning it.
    ///
    /// `f` runs under the signal's read lock and must not write to it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let (out, version) = {
            let cell = self.inner.cell.read();
            (f(&cell.value), cell.version)
        };
        self.track(version);
        out
    }

    /// Set a new value and notify dependents.
    ///
    /// Inside a propagation pass the write is queued and applied after the
    /// current notifications finish.
    pub fn set(&self, value: T) {
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.run_write(move || {
            inner.write_now(value, 0);
        });
    }

    /// Update the value using a function of the previous one.
    ///
    /// When queued, `f` sees the value as of when the write is applied, so
    /// several queued updates compose.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.run_write(move || {
            let current = inner.cell.read().value.clone();
            inner.write_now(f(&current), 0);
        });
    }

    /// Register a callback invoked with the new value after every change.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.inner.subscribers.add(callback)
    }

    /// Get the number of subscriber callbacks.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Get the number of computeds/effects currently depending on this signal.
    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }

    pub(crate) fn inner(&self) -> &Arc<SignalInner<T>> {
        &self.inner
    }

    fn track(&self, version: u64) {
        if self.inner.runtime.is_tracking() {
            let source: Arc<dyn Source> = self.inner.clone();
            self.inner.runtime.track(Dependency { source, version });
        }
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Signal<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.id())
            .field("value", &self.get_untracked())
            .field("version", &self.version())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn signal_get_and_set() {
        let rt = Runtime::new();
        let signal = Signal::new(&rt, 0);
        assert_eq!(signal.get(), 0);

        signal.set(42);
        assert_eq!(signal.get(), 42);
        assert_eq!(signal.version(), 1);
    }

    #[test]
    fn signal_update() {
        let rt = Runtime::new();
        let signal = Signal::new(&rt, 10);
        signal.update(|v| v + 5);
        assert_eq!(signal.get(), 15);
    }

    #[test]
    fn equal_write_is_a_no_op() {
        let rt = Runtime::new();
        let signal = Signal::new(&rt, "en".to_string());
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();
        let _sub = signal.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        signal.set("en".to_string());
        assert_eq!(signal.version(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn never_equality_always_notifies() {
        let rt = Runtime::new();
        let signal = Signal::with_equality(&rt, 1, Equality::never());
        signal.set(1);
        signal.set(1);
        assert_eq!(signal.version(), 2);
    }

    #[test]
    fn custom_equality_compares_by_key() {
        let rt = Runtime::new();
        let by_key = Equality::by(|a: &(i32, char), b: &(i32, char)| a.0 == b.0);
        let signal = Signal::with_equality(&rt, (1, 'a'), by_key);
        signal.set((1, 'b'));
        assert_eq!(signal.get_untracked(), (1, 'a'));
        signal.set((2, 'b'));
        assert_eq!(signal.version(), 1);
    }

    #[test]
    fn signal_notifies_subscribers_with_new_value() {
        let rt = Runtime::new();
        let signal = Signal::new(&rt, 0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let _sub = signal.subscribe(move |v| seen_clone.lock().push(*v));

        signal.set(1);
        signal.set(2);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn signal_unsubscribe() {
        let rt = Runtime::new();
        let signal = Signal::new(&rt, 0);
        let call_count = Arc::new(AtomicI32::new(0));
        let call_count_clone = call_count.clone();

        let sub = signal.subscribe(move |_| {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
        });

        signal.set(1);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);

        sub.cancel();
        signal.set(2);
        // Should not have been called again
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn reentrant_write_is_queued_until_notification_completes() {
        let rt = Runtime::new();
        let signal = Signal::new(&rt, 0);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let writer = signal.clone();
        let _first = signal.subscribe(move |v| {
            if *v == 1 {
                writer.set(2);
            }
        });
        let seen_clone = seen.clone();
        let _second = signal.subscribe(move |v| seen_clone.lock().push(*v));

        signal.set(1);

        // The second subscriber saw 1 before the queued write of 2 was applied.
        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(signal.get(), 2);
        assert_eq!(signal.version(), 2);
    }

    #[test]
    fn queued_updates_compose() {
        let rt = Runtime::new();
        let signal = Signal::new(&rt, 0);
        rt.batch(|| {
            signal.update(|v| v + 1);
            signal.update(|v| v + 1);
            signal.update(|v| v * 10);
        });
        assert_eq!(signal.get(), 20);
        assert_eq!(signal.version(), 3);
    }

    #[test]
    fn signal_clone_shares_state() {
        let rt = Runtime::new();
        let signal1 = Signal::new(&rt, 0);
        let signal2 = signal1.clone();

        signal1.set(42);
        assert_eq!(signal2.get(), 42);

        signal2.set(100);
        assert_eq!(signal1.get(), 100);
    }

    #[test]
    fn signal_ids_are_unique() {
        let rt = Runtime::new();
        let s1 = Signal::new(&rt, 0);
        let s2 = Signal::new(&rt, 0);
        let s3 = Signal::new(&rt, 0);

        assert_ne!(s1.id(), s2.id());
        assert_ne!(s2.id(), s3.id());
        assert_ne!(s1.id(), s3.id());
    }
}
