//! Stores
//!
//! Stores are the application-facing state containers: named signals with a
//! middleware pipeline, optional persistence, and a place in a [`Registry`]
//! so they can be captured into and restored from snapshots.
//!
//! - [`Store`]: read/write, middleware-guarded, optionally persisted.
//! - [`DerivedStore`]: read-only, computed from other values, never captured.
//! - [`Registry`]: owns the stores of one application, their runtime and
//!   configuration, and the devtools observers.

pub mod middleware;

mod derived;
mod persistence;
mod registry;
#[allow(clippy::module_inception)]
mod store;

pub use derived::{Constant, DerivedStore, Readable};
pub use middleware::Middleware;
pub use persistence::{
    BackgroundPersistence, JsonFilePersistence, MemoryPersistence, Persistence,
    MAX_PERSISTED_BYTES,
};
pub use registry::{Registry, RegistryBuilder, WeakRegistry};
pub use store::{HydrationState, Store, StoreOptions, StoreValue};
