//! Reactive Runtime
//!
//! The runtime is the coordinator shared by every signal, computed, effect
//! and store created against it. It owns two pieces of state:
//!
//! 1. The evaluation context stacks (see [`EvalContext`](super::EvalContext)),
//!    which record the sources read by whichever computation is running.
//!    There is one stack per thread, so computations evaluated on different
//!    threads never see each other's frames.
//!
//! 2. The propagation queue. A write that happens while another write is
//!    still propagating is deferred; so is every eager reaction (effects and
//!    computed subscriber deliveries). A propagation pass ends only when both
//!    queues are empty, so control returns to the caller of the outermost
//!    `set` at a settled state.
//!
//! # How a write propagates
//!
//! 1. The signal stores the value and bumps its version.
//! 2. Observers (computeds, effects) are marked "maybe dirty", depth first.
//!    Computeds do not evaluate here; effects enqueue a reaction.
//! 3. The signal's own subscribers run, oldest first.
//! 4. Deferred writes are applied in FIFO order, each repeating 1–3.
//! 5. Reactions run once each, in the order they were first scheduled.
//!
//! There is no ambient global: two runtimes never see each other's
//! contexts or queues.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{error, trace};

use super::context::Frame;
use super::subscriber::SubscriberId;
use crate::error::Result;

/// Upper bound on queued steps in one propagation pass.
///
/// Hitting it means a feedback loop (e.g. an effect that writes the signal
/// it reads with an ever-changing value).
pub const MAX_SETTLE_STEPS: usize = 100_000;

/// Something that can be told one of its inputs changed.
pub trait Reactive: Send + Sync {
    /// Get the subscriber ID for this reactive value.
    fn subscriber_id(&self) -> SubscriberId;

    /// Mark this reactive value as potentially needing update.
    ///
    /// Called synchronously from inside a write. Must not evaluate user code.
    fn mark_maybe_dirty(&self);
}

/// Something a computation can read from and depend on.
pub trait Source: Send + Sync {
    /// Stable identifier of the source.
    fn source_id(&self) -> u64;

    /// Bring the source up to date and report its version.
    fn current_version(&self) -> Result<u64>;

    /// Register an observer to be marked dirty on change.
    fn add_observer(&self, observer: Weak<dyn Reactive>);

    /// Unregister an observer.
    fn remove_observer(&self, id: SubscriberId);
}

/// A source read during evaluation, with the version that was observed.
#[derive(Clone)]
pub struct Dependency {
    pub(crate) source: Arc<dyn Source>,
    pub(crate) version: u64,
}

impl Dependency {
    pub fn source_id(&self) -> u64 {
        self.source.source_id()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether the source moved on since this dependency was recorded.
    pub(crate) fn is_stale(&self) -> Result<bool> {
        Ok(self.source.current_version()? != self.version)
    }
}

impl std::fmt::Debug for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependency")
            .field("source", &self.source_id())
            .field("version", &self.version)
            .finish()
    }
}

pub(crate) type DependencyList = SmallVec<[Dependency; 4]>;

/// Observers attached to one source, in registration order.
pub(crate) struct ObserverSet {
    observers: Mutex<IndexMap<SubscriberId, Weak<dyn Reactive>>>,
}

impl ObserverSet {
    pub(crate) fn new() -> Self {
        Self {
            observers: Mutex::new(IndexMap::new()),
        }
    }

    pub(crate) fn add(&self, observer: Weak<dyn Reactive>) {
        if let Some(strong) = observer.upgrade() {
            self.observers.lock().insert(strong.subscriber_id(), observer);
        }
    }

    pub(crate) fn remove(&self, id: SubscriberId) {
        self.observers.lock().shift_remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.observers.lock().len()
    }

    /// Mark every live observer maybe-dirty; drop the dead ones.
    pub(crate) fn notify(&self) {
        let live: SmallVec<[Arc<dyn Reactive>; 4]> = {
            let mut observers = self.observers.lock();
            observers.retain(|_, weak| weak.strong_count() > 0);
            observers.values().filter_map(Weak::upgrade).collect()
        };

        for observer in live {
            observer.mark_maybe_dirty();
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;
pub(crate) type Reaction = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Queue {
    propagating: bool,
    writes: VecDeque<Job>,
    reactions: IndexMap<SubscriberId, Reaction>,
}

enum Step {
    Write(Job),
    React(Reaction),
}

#[derive(Default)]
struct RuntimeInner {
    /// Evaluation stacks by thread. Empty stacks are removed.
    frames: Mutex<HashMap<ThreadId, Vec<Frame>>>,
    queue: Mutex<Queue>,
}

/// Handle to a reactive runtime. Cloning shares the runtime.
#[derive(Clone, Default)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a propagation pass is in progress.
    pub fn is_propagating(&self) -> bool {
        self.inner.queue.lock().propagating
    }

    /// Run `f` as a single propagation pass.
    ///
    /// Writes issued inside `f` are applied, in order, when `f` returns;
    /// reactions run once after all of them. Nested batches join the outer
    /// pass.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        if !self.begin_pass() {
            return f();
        }
        let _pass = PassGuard { runtime: self };
        let out = f();
        self.settle();
        out
    }

    /// Run `f` without recording any reads as dependencies.
    pub fn untrack<R>(&self, f: impl FnOnce() -> R) -> R {
        self.push_frame(Frame::untracked());
        let _frame = PopGuard { runtime: self };
        f()
    }

    /// Whether reads on the calling thread are currently being recorded.
    pub fn is_tracking(&self) -> bool {
        self.with_top_frame(|frame| frame.is_some_and(|frame| frame.tracking))
    }

    /// Get the subscriber whose evaluation is in progress on the calling
    /// thread, if any.
    pub fn current_subscriber(&self) -> Option<SubscriberId> {
        self.with_top_frame(|frame| frame.and_then(|frame| frame.subscriber_id))
    }

    /// Depth of the calling thread's evaluation context stack.
    pub fn context_depth(&self) -> usize {
        self.inner
            .frames
            .lock()
            .get(&thread::current().id())
            .map_or(0, Vec::len)
    }

    pub(crate) fn push_frame(&self, frame: Frame) {
        self.inner
            .frames
            .lock()
            .entry(thread::current().id())
            .or_default()
            .push(frame);
    }

    pub(crate) fn pop_frame(&self) -> Option<Frame> {
        let id = thread::current().id();
        let mut frames = self.inner.frames.lock();
        let stack = frames.get_mut(&id)?;
        let frame = stack.pop();
        if stack.is_empty() {
            frames.remove(&id);
        }
        frame
    }

    /// Record a read in the calling thread's innermost frame.
    pub(crate) fn track(&self, dependency: Dependency) {
        let mut frames = self.inner.frames.lock();
        if let Some(frame) = frames
            .get_mut(&thread::current().id())
            .and_then(|stack| stack.last_mut())
        {
            frame.record(dependency);
        }
    }

    fn with_top_frame<R>(&self, f: impl FnOnce(Option<&Frame>) -> R) -> R {
        let frames = self.inner.frames.lock();
        f(frames
            .get(&thread::current().id())
            .and_then(|stack| stack.last()))
    }

    /// Apply `write` now, or queue it if a pass is already running.
    pub(crate) fn run_write(&self, write: impl FnOnce() + Send + 'static) {
        {
            let mut queue = self.inner.queue.lock();
            if queue.propagating {
                trace!(queued = queue.writes.len() + 1, "deferring re-entrant write");
                queue.writes.push_back(Box::new(write));
                return;
            }
            queue.propagating = true;
        }

        let _pass = PassGuard { runtime: self };
        write();
        self.settle();
    }

    /// Queue a reaction to run once at the end of the current pass.
    ///
    /// Outside of a pass the reaction runs immediately.
    pub(crate) fn schedule_reaction(&self, id: SubscriberId, reaction: Reaction) {
        {
            let mut queue = self.inner.queue.lock();
            if queue.propagating {
                queue.reactions.entry(id).or_insert(reaction);
                return;
            }
            queue.propagating = true;
        }

        let _pass = PassGuard { runtime: self };
        reaction();
        self.settle();
    }

    fn begin_pass(&self) -> bool {
        let mut queue = self.inner.queue.lock();
        if queue.propagating {
            return false;
        }
        queue.propagating = true;
        true
    }

    /// Drain deferred writes, then reactions, until both queues are empty.
    fn settle(&self) {
        let mut steps = 0usize;
        loop {
            let step = {
                let mut queue = self.inner.queue.lock();
                if let Some(write) = queue.writes.pop_front() {
                    Step::Write(write)
                } else if let Some((_, reaction)) = queue.reactions.shift_remove_index(0) {
                    Step::React(reaction)
                } else {
                    break;
                }
            };

            steps += 1;
            if steps > MAX_SETTLE_STEPS {
                let mut queue = self.inner.queue.lock();
                error!(
                    dropped_writes = queue.writes.len(),
                    dropped_reactions = queue.reactions.len(),
                    "propagation did not settle after {MAX_SETTLE_STEPS} steps; aborting pass"
                );
                queue.writes.clear();
                queue.reactions.clear();
                break;
            }

            match step {
                Step::Write(write) => write(),
                Step::React(reaction) => reaction(),
            }
        }
        trace!(steps, "propagation settled");
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("context_depth", &self.context_depth())
            .field("propagating", &self.is_propagating())
            .finish()
    }
}

/// Ends the pass even if a write or reaction panics.
struct PassGuard<'a> {
    runtime: &'a Runtime,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        let mut queue = self.runtime.inner.queue.lock();
        queue.propagating = false;
        if std::thread::panicking() {
            queue.writes.clear();
            queue.reactions.clear();
        }
    }
}

struct PopGuard<'a> {
    runtime: &'a Runtime,
}

impl Drop for PopGuard<'_> {
    fn drop(&mut self) {
        self.runtime.pop_frame();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

    struct MockSource {
        id: u64,
        version: AtomicU64,
        observers: ObserverSet,
    }

    impl Source for MockSource {
        fn source_id(&self) -> u64 {
            self.id
        }

        fn current_version(&self) -> Result<u64> {
            Ok(self.version.load(Ordering::SeqCst))
        }

        fn add_observer(&self, observer: Weak<dyn Reactive>) {
            self.observers.add(observer);
        }

        fn remove_observer(&self, id: SubscriberId) {
            self.observers.remove(id);
        }
    }

    struct MockReactive {
        id: SubscriberId,
        marked: AtomicI32,
    }

    impl Reactive for MockReactive {
        fn subscriber_id(&self) -> SubscriberId {
            self.id
        }

        fn mark_maybe_dirty(&self) {
            self.marked.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn observer_set_notifies_and_prunes() {
        let set = ObserverSet::new();
        let alive = Arc::new(MockReactive {
            id: SubscriberId::new(),
            marked: AtomicI32::new(0),
        });
        let doomed: Arc<dyn Reactive> = Arc::new(MockReactive {
            id: SubscriberId::new(),
            marked: AtomicI32::new(0),
        });

        let alive_dyn: Arc<dyn Reactive> = alive.clone();
        set.add(Arc::downgrade(&alive_dyn));
        set.add(Arc::downgrade(&doomed));
        assert_eq!(set.len(), 2);

        drop(doomed);
        set.notify();

        assert_eq!(alive.marked.load(Ordering::SeqCst), 1);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn nested_writes_are_deferred_until_outer_write_finishes() {
        let runtime = Runtime::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let rt = runtime.clone();
        let log_outer = log.clone();
        runtime.run_write(move || {
            log_outer.lock().push("outer start");
            let log_inner = log_outer.clone();
            rt.run_write(move || log_inner.lock().push("inner"));
            log_outer.lock().push("outer end");
        });

        assert_eq!(*log.lock(), vec!["outer start", "outer end", "inner"]);
        assert!(!runtime.is_propagating());
    }

    #[test]
    fn reactions_are_deduplicated_within_a_pass() {
        let runtime = Runtime::new();
        let runs = Arc::new(AtomicI32::new(0));
        let id = SubscriberId::new();

        runtime.batch(|| {
            for _ in 0..3 {
                let runs = runs.clone();
                runtime.schedule_reaction(
                    id,
                    Arc::new(move || {
                        runs.fetch_add(1, Ordering::SeqCst);
                    }),
                );
            }
            assert_eq!(runs.load(Ordering::SeqCst), 0);
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tracking_records_reads_in_innermost_frame() {
        let runtime = Runtime::new();
        let source: Arc<dyn Source> = Arc::new(MockSource {
            id: 9,
            version: AtomicU64::new(3),
            observers: ObserverSet::new(),
        });

        assert!(!runtime.is_tracking());
        runtime.push_frame(Frame::tracked(SubscriberId::new()));
        runtime.track(Dependency {
            source: source.clone(),
            version: 3,
        });
        runtime.untrack(|| {
            assert!(!runtime.is_tracking());
            runtime.track(Dependency {
                source: source.clone(),
                version: 3,
            });
        });
        let frame = runtime.pop_frame().unwrap();

        assert_eq!(frame.dependencies.len(), 1);
        assert!(!frame.dependencies[0].is_stale().unwrap());
    }

    #[test]
    fn runaway_feedback_is_cut_off() {
        fn bounce(runtime: Runtime, count: Arc<AtomicU64>) {
            count.fetch_add(1, Ordering::Relaxed);
            let rt = runtime.clone();
            runtime.run_write(move || bounce(rt, count));
        }

        let runtime = Runtime::new();
        let count = Arc::new(AtomicU64::new(0));
        bounce(runtime.clone(), count.clone());

        assert!(count.load(Ordering::Relaxed) as usize <= MAX_SETTLE_STEPS + 2);
        assert!(!runtime.is_propagating());
    }
}
