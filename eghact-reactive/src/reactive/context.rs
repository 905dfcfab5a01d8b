//! Evaluation Context
//!
//! The evaluation context tracks which computation is currently running so
//! that reads can be recorded as dependencies.
//!
//! # Implementation
//!
//! The stacks live inside the [`Runtime`], one per thread, not in a
//! thread-local: a computation only ever sees frames pushed against the
//! runtime it was created with, on the thread it is running on. Entering a
//! context pushes a frame; the returned guard pops it when finished or
//! dropped, so the stack stays balanced even if the computation panics.
//!
//! Nested contexts are supported (a computed that reads another computed
//! evaluates the inner one in its own frame).

use std::marker::PhantomData;

use tracing::trace;

use super::runtime::{Dependency, DependencyList, Runtime};
use super::subscriber::SubscriberId;

/// An entry in the evaluation context stack.
pub(crate) struct Frame {
    /// The computation this frame belongs to; `None` for untracked scopes.
    pub(crate) subscriber_id: Option<SubscriberId>,
    pub(crate) tracking: bool,
    /// Sources read during this computation, first read wins.
    pub(crate) dependencies: DependencyList,
}

impl Frame {
    pub(crate) fn tracked(subscriber_id: SubscriberId) -> Self {
        Self {
            subscriber_id: Some(subscriber_id),
            tracking: true,
            dependencies: DependencyList::new(),
        }
    }

    pub(crate) fn untracked() -> Self {
        Self {
            subscriber_id: None,
            tracking: false,
            dependencies: DependencyList::new(),
        }
    }

    pub(crate) fn record(&mut self, dependency: Dependency) {
        if !self.tracking {
            return;
        }
        let id = dependency.source_id();
        if self.dependencies.iter().all(|dep| dep.source_id() != id) {
            self.dependencies.push(dependency);
        }
    }
}

/// Guard for one evaluation. Pops its frame when finished or dropped.
///
/// The guard stays on the thread that entered it.
pub struct EvalContext<'rt> {
    runtime: &'rt Runtime,
    subscriber_id: SubscriberId,
    finished: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl<'rt> EvalContext<'rt> {
    /// Enter a new evaluation context for the given subscriber.
    ///
    /// While this context is active, any source read through `runtime`
    /// is recorded as a dependency of the subscriber.
    pub fn enter(runtime: &'rt Runtime, subscriber_id: SubscriberId) -> Self {
        runtime.push_frame(Frame::tracked(subscriber_id));
        Self {
            runtime,
            subscriber_id,
            finished: false,
            _thread_bound: PhantomData,
        }
    }

    pub fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    /// Leave the context and take the dependencies it collected.
    pub fn finish(mut self) -> Vec<Dependency> {
        self.finished = true;
        self.pop().into_vec()
    }

    pub(crate) fn finish_list(mut self) -> DependencyList {
        self.finished = true;
        self.pop()
    }

    fn pop(&self) -> DependencyList {
        match self.runtime.pop_frame() {
            Some(frame) => {
                debug_assert_eq!(
                    frame.subscriber_id,
                    Some(self.subscriber_id),
                    "EvalContext mismatch"
                );
                trace!(
                    subscriber = self.subscriber_id.raw(),
                    dependencies = frame.dependencies.len(),
                    "evaluation finished"
                );
                frame.dependencies
            }
            None => DependencyList::new(),
        }
    }
}

impl Drop for EvalContext<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Signal;

    #[test]
    fn context_tracks_subscriber() {
        let runtime = Runtime::new();
        let id = SubscriberId::new();

        assert!(!runtime.is_tracking());
        assert!(runtime.current_subscriber().is_none());

        {
            let _ctx = EvalContext::enter(&runtime, id);
            assert!(runtime.is_tracking());
            assert_eq!(runtime.current_subscriber(), Some(id));
        }

        // Context should be cleaned up after drop
        assert!(!runtime.is_tracking());
        assert_eq!(runtime.context_depth(), 0);
    }

    #[test]
    fn context_collects_each_source_once() {
        let runtime = Runtime::new();
        let a = Signal::new(&runtime, 1);
        let b = Signal::new(&runtime, 2);

        let ctx = EvalContext::enter(&runtime, SubscriberId::new());
        a.get();
        b.get();
        a.get();
        let deps = ctx.finish();

        let ids: Vec<u64> = deps.iter().map(|d| d.source_id()).collect();
        assert_eq!(ids, vec![a.id(), b.id()]);
    }

    #[test]
    fn nested_contexts() {
        let runtime = Runtime::new();
        let outer_signal = Signal::new(&runtime, "outer");
        let inner_signal = Signal::new(&runtime, "inner");
        let id1 = SubscriberId::new();
        let id2 = SubscriberId::new();

        let outer = EvalContext::enter(&runtime, id1);
        outer_signal.get();
        {
            let inner = EvalContext::enter(&runtime, id2);
            assert_eq!(runtime.current_subscriber(), Some(id2));
            inner_signal.get();
            let deps = inner.finish();
            assert_eq!(deps.len(), 1);
            assert_eq!(deps[0].source_id(), inner_signal.id());
        }

        // After inner context finishes, outer should be current
        assert_eq!(runtime.current_subscriber(), Some(id1));
        let deps = outer.finish();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].source_id(), outer_signal.id());
    }

    #[test]
    fn runtimes_are_isolated() {
        let rt_a = Runtime::new();
        let rt_b = Runtime::new();
        let signal_b = Signal::new(&rt_b, 0);

        let ctx = EvalContext::enter(&rt_a, SubscriberId::new());
        signal_b.get();
        assert!(ctx.finish().is_empty());
    }

    #[test]
    fn threads_keep_separate_stacks() {
        use std::sync::{Arc, Barrier};

        let runtime = Runtime::new();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let runtime = runtime.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let own = Signal::new(&runtime, 0);
                    let ctx = EvalContext::enter(&runtime, SubscriberId::new());
                    // Both threads are inside a context here.
                    barrier.wait();
                    own.get();
                    assert_eq!(runtime.context_depth(), 1);
                    barrier.wait();
                    let deps = ctx.finish();
                    assert_eq!(deps.len(), 1);
                    assert_eq!(deps[0].source_id(), own.id());
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(runtime.context_depth(), 0);
        assert!(!runtime.is_tracking());
    }
}
