//! Effect Implementation
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its function immediately to establish
//!    initial dependencies.
//!
//! 2. When any dependency changes, the effect schedules itself as a reaction
//!    on the runtime. Reactions run after all writes of the current pass
//!    have been applied, and at most once per pass.
//!
//! 3. Before re-running, the effect checks whether any dependency actually
//!    moved (a computed may have been marked but produced the same value).
//!    If so, it re-runs and rebuilds its dependency list.
//!
//! # Differences from Computed
//!
//! - Computeds return a value; effects do not.
//! - Computeds are lazy (compute on access); effects are eager.
//! - Computeds cache results; effects just run their side effect.
//!
//! The effect stops when disposed or when its last handle is dropped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use super::context::EvalContext;
use super::runtime::{DependencyList, Reactive, Reaction, Runtime};
use super::signal::next_source_id;
use super::subscriber::SubscriberId;

struct EffectInner {
    id: u64,
    subscriber_id: SubscriberId,
    runtime: Runtime,
    run: Box<dyn Fn() + Send + Sync>,
    dependencies: Mutex<DependencyList>,
    disposed: AtomicBool,
    run_count: AtomicUsize,
    this: Weak<EffectInner>,
}

impl EffectInner {
    /// Run the effect within an evaluation context to track dependencies.
    fn execute(&self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }

        let ctx = EvalContext::enter(&self.runtime, self.subscriber_id);
        (self.run)();
        let current = ctx.finish_list();

        let previous = std::mem::replace(&mut *self.dependencies.lock(), current.clone());
        for old in &previous {
            let id = old.source_id();
            if current.iter().all(|dep| dep.source_id() != id) {
                old.source.remove_observer(self.subscriber_id);
            }
        }
        let this: Weak<dyn Reactive> = self.this.clone();
        for dep in &current {
            dep.source.add_observer(this.clone());
        }

        let runs = self.run_count.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(effect = self.id, runs, dependencies = current.len(), "effect ran");
    }

    /// Re-run only if a dependency moved. A dependency that fails to refresh
    /// counts as moved; the effect body decides what to do with the error.
    fn react(&self) {
        let dependencies = self.dependencies.lock().clone();
        let stale = dependencies.is_empty()
            || dependencies
                .iter()
                .any(|dep| dep.is_stale().unwrap_or(true));
        if stale {
            self.execute();
        }
    }

    fn reaction(&self) -> Reaction {
        let this = self.this.clone();
        Arc::new(move || {
            if let Some(inner) = this.upgrade() {
                inner.react();
            }
        })
    }

    fn detach_all(&self) {
        let dependencies = std::mem::take(&mut *self.dependencies.lock());
        for dep in &dependencies {
            dep.source.remove_observer(self.subscriber_id);
        }
    }
}

impl Reactive for EffectInner {
    fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    fn mark_maybe_dirty(&self) {
        if !self.disposed.load(Ordering::Acquire) {
            self.runtime
                .schedule_reaction(self.subscriber_id, self.reaction());
        }
    }
}

impl Drop for EffectInner {
    fn drop(&mut self) {
        for dep in self.dependencies.get_mut().drain(..) {
            dep.source.remove_observer(self.subscriber_id);
        }
    }
}

/// A side-effecting computation that runs when dependencies change.
///
/// # Example
///
/// ```rust
/// use std::sync::{Arc, atomic::{AtomicI32, Ordering}};
/// use eghact_reactive::reactive::{Effect, Runtime, Signal};
///
/// let rt = Runtime::new();
/// let count = Signal::new(&rt, 0);
/// let seen = Arc::new(AtomicI32::new(-1));
///
/// let _effect = Effect::new(&rt, {
///     let (count, seen) = (count.clone(), seen.clone());
///     move || seen.store(count.get(), Ordering::SeqCst)
/// });
///
/// count.set(5);
/// assert_eq!(seen.load(Ordering::SeqCst), 5);
/// ```
pub struct Effect {
    inner: Arc<EffectInner>,
}

impl Effect {
    /// Create a new effect with the given function.
    ///
    /// The function runs immediately to establish initial dependencies.
    pub fn new<F>(runtime: &Runtime, run: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let effect = Self::new_lazy(runtime, run);
        effect.execute();
        effect
    }

    /// Create a new effect without running it immediately.
    ///
    /// It has no dependencies until [`Effect::execute`] is called.
    pub fn new_lazy<F>(runtime: &Runtime, run: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let inner = Arc::new_cyclic(|this| EffectInner {
            id: next_source_id(),
            subscriber_id: SubscriberId::new(),
            runtime: runtime.clone(),
            run: Box::new(run),
            dependencies: Mutex::new(DependencyList::new()),
            disposed: AtomicBool::new(false),
            run_count: AtomicUsize::new(0),
            this: this.clone(),
        });
        Self { inner }
    }

    /// Get the effect's unique ID.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Get the subscriber ID for this effect.
    pub fn subscriber_id(&self) -> SubscriberId {
        self.inner.subscriber_id
    }

    /// Run the effect function now, unconditionally.
    pub fn execute(&self) {
        self.inner.execute();
    }

    /// Schedule the effect to re-run at the end of the current pass (or now,
    /// outside of one).
    pub fn schedule(&self) {
        if self.inner.disposed.load(Ordering::Acquire) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner
            .runtime
            .schedule_reaction(self.inner.subscriber_id, Arc::new(move || inner.execute()));
    }

    /// Dispose of the effect.
    ///
    /// After disposal, the effect will not run again.
    pub fn dispose(&self) {
        if !self.inner.disposed.swap(true, Ordering::AcqRel) {
            self.inner.detach_all();
        }
    }

    /// Check if the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Get the number of times the effect has run.
    pub fn run_count(&self) -> usize {
        self.inner.run_count.load(Ordering::Acquire)
    }

    /// Get the number of dependencies.
    pub fn dependency_count(&self) -> usize {
        self.inner.dependencies.lock().len()
    }
}

impl Clone for Effect {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.id())
            .field("run_count", &self.run_count())
            .field("dependency_count", &self.dependency_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
