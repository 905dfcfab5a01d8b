//! Computed Implementation
//!
//! A Computed is a cached derived value that re-evaluates only when its
//! dependencies change.
//!
//! # How Computeds Work
//!
//! 1. On first access, the computed runs its function inside an evaluation
//!    context and caches the result, together with the version of every
//!    source it read (the input version vector).
//!
//! 2. When a source changes, the computed is marked `MaybeDirty` and passes
//!    the mark on to its own observers. Nothing is evaluated at this point.
//!
//! 3. On next access, a `MaybeDirty` computed compares its input version
//!    vector against the sources' current versions. Only if one moved does
//!    it recompute; otherwise it goes back to `Clean` and serves the cache.
//!
//! 4. Dependencies are rebuilt on every evaluation, so a branch that is no
//!    longer taken stops contributing dependencies.
//!
//! # Why This Matters
//!
//! When several sources change in one pass (the diamond case), the computed
//! is only marked several times; it evaluates once, on the next read.
//!
//! # Errors
//!
//! An evaluation that fails leaves the computed `Dirty` (never serving a
//! poisoned cache); the error goes to whoever triggered the read.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, trace, warn};

use super::context::EvalContext;
use super::runtime::{Dependency, DependencyList, ObserverSet, Reactive, Reaction, Runtime, Source};
use super::signal::next_source_id;
use super::subscriber::{SubscriberId, SubscriberList, Subscription};
use crate::error::{Result, StateError};

/// Dirty state for a computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputedState {
    /// The cached value is up-to-date.
    Clean,

    /// A dependency might have changed. Need to check input versions.
    MaybeDirty,

    /// The computed definitely needs to recompute (never evaluated, or the
    /// last evaluation failed).
    Dirty,
}

type ComputeFn<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

struct Cache<T> {
    value: Option<T>,
    state: ComputedState,
    version: u64,
    dependencies: DependencyList,
    /// Observers have been told about a change since the last evaluation.
    notified: bool,
}

pub(crate) struct ComputedInner<T> {
    id: u64,
    subscriber_id: SubscriberId,
    runtime: Runtime,
    compute: ComputeFn<T>,
    cache: Mutex<Cache<T>>,
    /// Held for the duration of an evaluation. Another thread waits; the
    /// same thread re-entering is a cycle.
    evaluation: ReentrantMutex<()>,
    evaluating: AtomicBool,
    disposed: AtomicBool,
    observers: ObserverSet,
    subscribers: SubscriberList<T>,
    /// Version last handed to subscribers.
    delivered: AtomicU64,
    this: Weak<ComputedInner<T>>,
}

impl<T> ComputedInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Make the cache valid, recomputing only if an input moved.
    fn refresh(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StateError::Disposed(format!("computed #{}", self.id)));
        }

        let (state, dependencies) = {
            let cache = self.cache.lock();
            let deps = match cache.state {
                ComputedState::MaybeDirty => cache.dependencies.clone(),
                _ => DependencyList::new(),
            };
            (cache.state, deps)
        };

        match state {
            ComputedState::Clean => Ok(()),
            ComputedState::Dirty => self.recompute(),
            ComputedState::MaybeDirty => {
                for dependency in &dependencies {
                    if dependency.is_stale()? {
                        return self.recompute();
                    }
                }
                let mut cache = self.cache.lock();
                if cache.state == ComputedState::MaybeDirty {
                    cache.state = ComputedState::Clean;
                    cache.notified = false;
                }
                trace!(computed = self.id, "inputs unchanged; cache reused");
                Ok(())
            }
        }
    }

    /// Run the computation within an evaluation context to track dependencies.
    fn recompute(&self) -> Result<()> {
        let _evaluation = self.evaluation.lock();
        if self.evaluating.swap(true, Ordering::AcqRel) {
            return Err(StateError::Cycle(self.id));
        }
        let _evaluating = EvaluatingGuard(&self.evaluating);
        if self.cache.lock().state == ComputedState::Clean {
            // Another thread finished this evaluation while we waited.
            return Ok(());
        }

        let ctx = EvalContext::enter(&self.runtime, self.subscriber_id);
        let result = (self.compute)();
        let mut dependencies = ctx.finish_list();
        dependencies.retain(|dep| dep.source_id() != self.id);

        let previous = {
            let cache = self.cache.lock();
            cache.dependencies.clone()
        };
        self.resubscribe(&previous, &dependencies);

        let mut cache = self.cache.lock();
        cache.dependencies = dependencies;
        cache.notified = false;
        match result {
            Ok(value) => {
                if cache.value.as_ref() != Some(&value) {
                    cache.version += 1;
                }
                cache.value = Some(value);
                cache.state = ComputedState::Clean;
                trace!(computed = self.id, version = cache.version, "recomputed");
                Ok(())
            }
            Err(err) => {
                cache.state = ComputedState::Dirty;
                debug!(computed = self.id, error = %err, "evaluation failed");
                Err(err)
            }
        }
    }

    /// Detach from sources no longer read; attach to every source read now.
    fn resubscribe(&self, previous: &DependencyList, current: &DependencyList) {
        for old in previous {
            let id = old.source_id();
            if current.iter().all(|dep| dep.source_id() != id) {
                old.source.remove_observer(self.subscriber_id);
            }
        }
        let this: Weak<dyn Reactive> = self.this.clone();
        for dep in current {
            dep.source.add_observer(this.clone());
        }
    }

    fn cached(&self) -> (Option<T>, u64) {
        let cache = self.cache.lock();
        (cache.value.clone(), cache.version)
    }

    /// Bring the value up to date and hand it to subscribers if it moved.
    fn deliver(&self) {
        if let Err(err) = self.refresh() {
            warn!(computed = self.id, error = %err, "computed subscribers not notified");
            return;
        }
        let (value, version) = self.cached();
        let Some(value) = value else { return };
        if self.delivered.swap(version, Ordering::AcqRel) != version {
            self.subscribers.dispatch(&value);
        }
    }

    fn detach_all(&self) {
        let dependencies = std::mem::take(&mut self.cache.lock().dependencies);
        for dep in &dependencies {
            dep.source.remove_observer(self.subscriber_id);
        }
    }
}

impl<T> Reactive for ComputedInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    fn mark_maybe_dirty(&self) {
        let first_notice = {
            let mut cache = self.cache.lock();
            if cache.state == ComputedState::Clean {
                cache.state = ComputedState::MaybeDirty;
            }
            !std::mem::replace(&mut cache.notified, true)
        };

        if first_notice {
            self.observers.notify();
        }

        if !self.subscribers.is_empty() {
            let this = self.this.clone();
            let reaction: Reaction = Arc::new(move || {
                if let Some(inner) = this.upgrade() {
                    inner.deliver();
                }
            });
            self.runtime.schedule_reaction(self.subscriber_id, reaction);
        }
    }
}

impl<T> Source for ComputedInner<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn source_id(&self) -> u64 {
        self.id
    }

    fn current_version(&self) -> Result<u64> {
        self.refresh()?;
        Ok(self.cache.lock().version)
    }

    fn add_observer(&self, observer: Weak<dyn Reactive>) {
        self.observers.add(observer);
    }

    fn remove_observer(&self, id: SubscriberId) {
        self.observers.remove(id);
    }
}

impl<T> Drop for ComputedInner<T> {
    fn drop(&mut self) {
        for dep in self.cache.get_mut().dependencies.drain(..) {
            dep.source.remove_observer(self.subscriber_id);
        }
    }
}

struct EvaluatingGuard<'a>(&'a AtomicBool);

impl Drop for EvaluatingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A cached derived value that recomputes only when dependencies change.
///
/// The `PartialEq` bound is needed to detect when the computed value actually
/// changed (a computed can return the same value even if inputs changed), so
/// that its own version only moves on real changes.
///
/// # Example
///
/// ```rust
/// use eghact_reactive::reactive::{Computed, Runtime, Signal};
///
/// let rt = Runtime::new();
/// let count = Signal::new(&rt, 2);
/// let doubled = Computed::new(&rt, {
///     let count = count.clone();
///     move || count.get() * 2
/// });
///
/// assert_eq!(doubled.get().unwrap(), 4);
/// count.set(5);
/// assert_eq!(doubled.get().unwrap(), 10);
/// ```
pub struct Computed<T> {
    inner: Arc<ComputedInner<T>>,
}

impl<T> Computed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a computed from an infallible function.
    ///
    /// The computation is not run immediately. It runs on first access.
    pub fn new<F>(runtime: &Runtime, compute: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::try_new(runtime, move || Ok(compute()))
    }

    /// Create a computed whose evaluation can fail.
    pub fn try_new<F>(runtime: &Runtime, compute: F) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        let inner = Arc::new_cyclic(|this| ComputedInner {
            id: next_source_id(),
            subscriber_id: SubscriberId::new(),
            runtime: runtime.clone(),
            compute: Box::new(compute),
            cache: Mutex::new(Cache {
                value: None,
                state: ComputedState::Dirty,
                version: 0,
                dependencies: DependencyList::new(),
                notified: false,
            }),
            evaluation: ReentrantMutex::new(()),
            evaluating: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            observers: ObserverSet::new(),
            subscribers: SubscriberList::new(),
            delivered: AtomicU64::new(0),
            this: this.clone(),
        });
        Self { inner }
    }

    /// Get the computed's unique ID.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Get the subscriber ID used for dependency tracking.
    pub fn subscriber_id(&self) -> SubscriberId {
        self.inner.subscriber_id
    }

    /// Get the current value, recomputing if necessary.
    ///
    /// Inside an evaluation context the computed is recorded as a dependency,
    /// even when evaluation fails, so the reader retries once it recovers.
    pub fn get(&self) -> Result<T> {
        let refreshed = self.inner.refresh();
        let (value, version) = self.inner.cached();
        self.track(version);
        refreshed?;
        value.ok_or_else(|| StateError::Compute(format!("computed #{} has no value", self.inner.id)))
    }

    /// Get the current value without tracking dependencies.
    pub fn get_untracked(&self) -> Result<T> {
        self.inner.runtime.untrack(|| self.get())
    }

    /// Version of the computed value; moves only when the value changes.
    ///
    /// Brings the value up to date first.
    pub fn version(&self) -> Result<u64> {
        self.inner.current_version()
    }

    /// Register a callback invoked with the new value after a pass in which
    /// the value changed.
    ///
    /// Subscribing evaluates the computed once so that its dependencies are
    /// known; an evaluation error at this point is logged, not returned.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        if let Err(err) = self.inner.refresh() {
            debug!(computed = self.inner.id, error = %err, "subscribed to failing computed");
        }
        let (_, version) = self.inner.cached();
        self.inner.delivered.store(version, Ordering::Release);
        self.inner.subscribers.add(callback)
    }

    /// Detach from all sources and drop subscribers. Further reads fail.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.detach_all();
        self.inner.subscribers.clear();
        self.inner.cache.lock().state = ComputedState::Dirty;
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Get the current dirty state.
    pub fn state(&self) -> ComputedState {
        self.inner.cache.lock().state
    }

    /// Sources read by the last evaluation, in read order.
    pub fn dependencies(&self) -> Vec<Dependency> {
        self.inner.cache.lock().dependencies.to_vec()
    }

    /// Check if the computed has a cached value.
    pub fn has_value(&self) -> bool {
        self.inner.cache.lock().value.is_some()
    }

    /// Get the number of computeds/effects depending on this one.
    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    fn track(&self, version: u64) {
        if self.inner.runtime.is_tracking() {
            let source: Arc<dyn Source> = self.inner.clone();
            self.inner.runtime.track(Dependency { source, version });
        }
    }
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Computed<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("has_value", &self.has_value())
            .field("observer_count", &self.observer_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Signal;
    use std::sync::atomic::AtomicI32;

    fn counting<T, F>(rt: &Runtime, calls: &Arc<AtomicI32>, f: F) -> Computed<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let calls = calls.clone();
        Computed::new(rt, move || {
            calls.fetch_add(1, Ordering::SeqCst);
            f()
        })
    }

    #[test]
    fn computed_evaluates_on_first_access() {
        let rt = Runtime::new();
        let calls = Arc::new(AtomicI32::new(0));
        let computed = counting(&rt, &calls, || 42);

        // Not computed yet
        assert!(!computed.has_value());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(computed.get().unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(computed.has_value());
    }

    #[test]
    fn computed_caches_value_when_clean() {
        let rt = Runtime::new();
        let calls = Arc::new(AtomicI32::new(0));
        let computed = counting(&rt, &calls, || 42);

        for _ in 0..3 {
            assert_eq!(computed.get().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dependency_write_marks_without_evaluating() {
        let rt = Runtime::new();
        let source = Signal::new(&rt, 1);
        let calls = Arc::new(AtomicI32::new(0));
        let s = source.clone();
        let computed = counting(&rt, &calls, move || s.get() + 1);

        assert_eq!(computed.get().unwrap(), 2);
        source.set(10);

        assert_eq!(computed.state(), ComputedState::MaybeDirty);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(computed.get().unwrap(), 11);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(computed.state(), ComputedState::Clean);
    }

    #[test]
    fn diamond_evaluates_once() {
        let rt = Runtime::new();
        let a = Signal::new(&rt, 1);
        let b = Signal::new(&rt, 2);
        let calls = Arc::new(AtomicI32::new(0));
        let (a2, b2) = (a.clone(), b.clone());
        let sum = counting(&rt, &calls, move || a2.get() + b2.get());

        assert_eq!(sum.get().unwrap(), 3);
        a.set(10);
        b.set(20);
        assert_eq!(sum.get().unwrap(), 30);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unchanged_upstream_computed_skips_downstream_evaluation() {
        let rt = Runtime::new();
        let n = Signal::new(&rt, 3);
        let n2 = n.clone();
        let parity = Computed::new(&rt, move || n2.get() % 2);

        let calls = Arc::new(AtomicI32::new(0));
        let p2 = parity.clone();
        let label = counting(&rt, &calls, move || {
            if p2.get().unwrap() == 0 { "even" } else { "odd" }
        });

        assert_eq!(label.get().unwrap(), "odd");
        n.set(5);
        assert_eq!(label.state(), ComputedState::MaybeDirty);
        assert_eq!(label.get().unwrap(), "odd");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn conditional_dependencies_are_dropped() {
        let rt = Runtime::new();
        let flag = Signal::new(&rt, true);
        let b = Signal::new(&rt, 1);
        let calls = Arc::new(AtomicI32::new(0));
        let (f2, b2) = (flag.clone(), b.clone());
        let computed = counting(&rt, &calls, move || if f2.get() { b2.get() } else { 0 });

        assert_eq!(computed.get().unwrap(), 1);
        assert_eq!(b.observer_count(), 1);

        flag.set(false);
        assert_eq!(computed.get().unwrap(), 0);
        assert_eq!(b.observer_count(), 0);

        b.set(99);
        assert_eq!(computed.state(), ComputedState::Clean);
        assert_eq!(computed.get().unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_evaluation_stays_dirty_and_retries() {
        let rt = Runtime::new();
        let input = Signal::new(&rt, -1);
        let i2 = input.clone();
        let sqrt = Computed::try_new(&rt, move || {
            let v = i2.get();
            if v < 0 {
                Err(StateError::compute("negative input"))
            } else {
                Ok((v as f64).sqrt() as i64)
            }
        });

        assert!(matches!(sqrt.get(), Err(StateError::Compute(_))));
        assert_eq!(sqrt.state(), ComputedState::Dirty);

        input.set(16);
        assert_eq!(sqrt.get().unwrap(), 4);
        assert_eq!(sqrt.state(), ComputedState::Clean);
    }

    #[test]
    fn self_reference_is_a_cycle_error() {
        let rt = Runtime::new();
        let slot: Arc<Mutex<Option<Computed<i32>>>> = Arc::new(Mutex::new(None));
        let slot2 = slot.clone();
        let looped = Computed::try_new(&rt, move || {
            let me = slot2.lock().clone();
            match me {
                Some(me) => me.get().map(|v| v + 1),
                None => Ok(0),
            }
        });
        *slot.lock() = Some(looped.clone());

        assert!(matches!(looped.get(), Err(StateError::Cycle(_))));
        *slot.lock() = None;
    }

    #[test]
    fn concurrent_reads_evaluate_once() {
        use std::sync::Barrier;

        let rt = Runtime::new();
        let calls = Arc::new(AtomicI32::new(0));
        let input = Signal::new(&rt, 6);
        let slow = counting(&rt, &calls, {
            let input = input.clone();
            move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                input.get() * 7
            }
        });

        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (slow, barrier) = (slow.clone(), barrier.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    slow.get()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(slow.dependencies().len(), 1);
    }

    #[test]
    fn subscribers_get_settled_value_once_per_pass() {
        let rt = Runtime::new();
        let a = Signal::new(&rt, 1);
        let b = Signal::new(&rt, 1);
        let (a2, b2) = (a.clone(), b.clone());
        let sum = Computed::new(&rt, move || a2.get() + b2.get());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = sum.subscribe(move |v| seen2.lock().push(*v));

        rt.batch(|| {
            a.set(10);
            b.set(20);
        });
        assert_eq!(*seen.lock(), vec![30]);

        // A change that leaves the sum unchanged is not delivered.
        rt.batch(|| {
            a.set(20);
            b.set(10);
        });
        assert_eq!(*seen.lock(), vec![30]);
    }

    #[test]
    fn dispose_detaches_from_sources() {
        let rt = Runtime::new();
        let source = Signal::new(&rt, 1);
        let s2 = source.clone();
        let computed = Computed::new(&rt, move || s2.get());
        computed.get().unwrap();
        assert_eq!(source.observer_count(), 1);

        computed.dispose();
        assert!(computed.is_disposed());
        assert_eq!(source.observer_count(), 0);
        assert!(matches!(computed.get(), Err(StateError::Disposed(_))));
    }

    #[test]
    fn dropping_last_handle_detaches() {
        let rt = Runtime::new();
        let source = Signal::new(&rt, 1);
        {
            let s2 = source.clone();
            let computed = Computed::new(&rt, move || s2.get());
            computed.get().unwrap();
            assert_eq!(source.observer_count(), 1);
        }
        assert_eq!(source.observer_count(), 0);
    }

    #[test]
    fn computed_clone_shares_state() {
        let rt = Runtime::new();
        let computed1 = Computed::new(&rt, || 42);
        assert_eq!(computed1.get().unwrap(), 42);

        let computed2 = computed1.clone();
        assert_eq!(computed1.id(), computed2.id());
        assert!(computed2.has_value());
    }
}
