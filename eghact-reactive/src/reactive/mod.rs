//! Reactive Primitives
//!
//! This module implements the core reactive system: signals, computeds, and
//! effects. Stores, derived stores and the snapshot codec are built on top of
//! these primitives.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. When a signal's value is read
//! within an evaluation context (a computed or effect), the signal records
//! itself as a dependency of that computation. When the signal's value
//! changes, all dependents are marked and its subscribers are called.
//!
//! ## Computeds
//!
//! A Computed is a derived value that caches its result. Changes upstream only
//! mark it; it re-evaluates on the next read, and only when one of the inputs
//! it read last time actually moved. Two inputs changing in the same batch
//! cost one evaluation.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change. Effects run after all writes of a pass have been
//! applied, so they never see a half-updated graph.
//!
//! # Implementation Notes
//!
//! Dependency tracking goes through an explicit [`Runtime`] handle that every
//! primitive is constructed with. The runtime owns the evaluation context
//! stack and the propagation queue; there is no thread-local or global state.

mod computed;
mod context;
mod effect;
mod runtime;
mod signal;
mod subscriber;

pub use computed::{Computed, ComputedState};
pub use context::EvalContext;
pub use effect::Effect;
pub use runtime::{Dependency, Reactive, Runtime, Source, MAX_SETTLE_STEPS};
pub use signal::{Equality, Signal};
pub use subscriber::{SubscriberId, Subscription};
