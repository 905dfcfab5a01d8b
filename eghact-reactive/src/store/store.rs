//! Store Implementation
//!
//! A Store is a named signal with a write pipeline in front of it.
//!
//! # How a Write Works
//!
//! 1. The candidate value is computed (`set` takes it as is, `update` calls
//!    the updater with the latest value).
//!
//! 2. The candidate runs through the middleware chain. An error aborts the
//!    write; nothing is mutated. A result equal to the previous value is a
//!    veto and is dropped silently.
//!
//! 3. The value is committed to the underlying signal. Dependents are marked,
//!    subscribers run, the persistence backend (if any) is asked to save, and
//!    registry observers receive an [`UpdateEvent`].
//!
//! Writes issued while a propagation pass is running (from a subscriber, an
//! effect or inside [`Runtime::batch`]) run their middleware immediately but
//! commit when the pass gets to them. `update` sees the value of the latest
//! accepted write, so several queued updates compose.
//!
//! # Hydration Lifecycle
//!
//! ```text
//! Uninitialized -> DefaultValue -> PersistedRestore -> SnapshotRestored -> Live
//! ```
//!
//! The restore steps are optional. The state only moves forward; the first
//! local write (or [`Registry::go_live`]) makes a store `Live`.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::middleware::{run_chain, Middleware};
use super::persistence::Persistence;
use super::registry::{ErasedStore, Registry};
use crate::clock::Clock;
use crate::devtools::{ObserverHub, UpdateEvent, UpdateOrigin};
use crate::error::Result;
use crate::reactive::{Runtime, Signal, Subscription};
use crate::snapshot::{HydrateOutcome, RestoreMode, StoreState};

/// Bounds every store value satisfies.
pub trait StoreValue: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> StoreValue for T where T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Where a store is in its hydration lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HydrationState {
    Uninitialized,
    DefaultValue,
    PersistedRestore,
    SnapshotRestored,
    Live,
}

/// Construction options for a [`Store`].
pub struct StoreOptions<T> {
    middleware: Vec<Arc<dyn Middleware<T>>>,
    persistence: Option<Arc<dyn Persistence>>,
    exportable: bool,
}

impl<T> Default for StoreOptions<T> {
    fn default() -> Self {
        Self {
            middleware: Vec::new(),
            persistence: None,
            exportable: true,
        }
    }
}

impl<T: 'static> StoreOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware. Middleware run in the order they were added.
    pub fn middleware(mut self, middleware: impl Middleware<T> + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Restore from and save to `backend`, keyed by the store name.
    pub fn persistence(mut self, backend: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(backend);
        self
    }

    /// Whether the store is included in snapshots. Defaults to true.
    pub fn exportable(mut self, exportable: bool) -> Self {
        self.exportable = exportable;
        self
    }
}

/// The latest accepted write that has not been committed yet.
struct Staged<T> {
    value: Option<T>,
    outstanding: usize,
}

pub(crate) struct StoreInner<T> {
    name: String,
    signal: Signal<T>,
    middleware: RwLock<Vec<Arc<dyn Middleware<T>>>>,
    storage: Option<Arc<dyn Persistence>>,
    exportable: bool,
    created_at: u64,
    updated_at: AtomicU64,
    hydration: Mutex<HydrationState>,
    staged: Mutex<Staged<T>>,
    clock: Arc<dyn Clock>,
    hub: Arc<ObserverHub>,
}

impl<T: StoreValue> StoreInner<T> {
    fn new(registry: &Registry, name: String, default: T, options: StoreOptions<T>) -> Self {
        let mut state = HydrationState::DefaultValue;
        let mut initial = default;

        if let Some(storage) = &options.persistence {
            match storage.restore(&name) {
                Ok(Some(saved)) => match serde_json::from_value::<T>(saved) {
                    Ok(value) => {
                        debug!(store = %name, "restored persisted value");
                        initial = value;
                        state = HydrationState::PersistedRestore;
                    }
                    Err(err) => {
                        warn!(store = %name, error = %err, "persisted value does not match store type; using default")
                    }
                },
                Ok(None) => trace!(store = %name, "nothing persisted"),
                Err(err) => {
                    warn!(store = %name, error = %err, "persistence restore failed; using default")
                }
            }
        }

        let now = registry.clock().now_ms();
        Self {
            signal: Signal::new(registry.runtime(), initial),
            middleware: RwLock::new(options.middleware),
            storage: options.persistence,
            exportable: options.exportable,
            created_at: now,
            updated_at: AtomicU64::new(now),
            hydration: Mutex::new(state),
            staged: Mutex::new(Staged {
                value: None,
                outstanding: 0,
            }),
            clock: Arc::clone(registry.clock()),
            hub: Arc::clone(registry.hub()),
            name,
        }
    }

    /// Value the next write will be compared against.
    fn latest(&self) -> T {
        let staged = self.staged.lock().value.clone();
        staged.unwrap_or_else(|| self.signal.get_untracked())
    }

    fn stage(&self, value: T) {
        let mut staged = self.staged.lock();
        staged.value = Some(value);
        staged.outstanding += 1;
    }

    fn unstage(&self) {
        let mut staged = self.staged.lock();
        staged.outstanding = staged.outstanding.saturating_sub(1);
        if staged.outstanding == 0 {
            staged.value = None;
        }
    }

    fn advance(&self, to: HydrationState) {
        let mut state = self.hydration.lock();
        if to > *state {
            debug!(store = %self.name, from = ?*state, to = ?to, "hydration state advanced");
            *state = to;
        }
    }

    /// Write `next` into the signal and run the store-level side effects.
    fn commit(&self, next: T, origin: UpdateOrigin, min_version: u64, timestamp: Option<u64>) {
        if origin == UpdateOrigin::Local {
            self.unstage();
        }

        let previous = self.signal.get_untracked();
        if previous == next {
            if origin == UpdateOrigin::Hydrate {
                // The snapshot still vouches for this version.
                self.signal.inner().adopt_version(min_version);
                self.advance(HydrationState::SnapshotRestored);
            }
            trace!(store = %self.name, ?origin, "commit skipped: value unchanged");
            return;
        }

        let now = timestamp.unwrap_or_else(|| self.clock.now_ms());
        self.updated_at.store(now, Ordering::Release);
        match origin {
            UpdateOrigin::Local => self.advance(HydrationState::Live),
            UpdateOrigin::Hydrate => self.advance(HydrationState::SnapshotRestored),
            UpdateOrigin::Replay => {}
        }

        self.signal.inner().write_now(next.clone(), min_version);
        let version = self.signal.version();
        trace!(store = %self.name, version, ?origin, "store committed");

        if origin == UpdateOrigin::Local {
            self.persist(&next);
        }

        self.hub.broadcast(|| UpdateEvent {
            store_name: self.name.clone(),
            previous_value: self.encode(&previous),
            next_value: self.encode(&next),
            origin,
            version,
            timestamp: now,
        });
    }

    fn persist(&self, value: &T) {
        let Some(storage) = &self.storage else {
            return;
        };
        let encoded = match serde_json::to_value(value) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(store = %self.name, error = %err, "value is not JSON-representable; not saved");
                return;
            }
        };
        if let Err(err) = storage.save(&self.name, &encoded) {
            warn!(store = %self.name, error = %err, "persistence save failed; continuing in memory");
        }
    }

    fn encode(&self, value: &T) -> Value {
        serde_json::to_value(value).unwrap_or_else(|err| {
            warn!(store = %self.name, error = %err, "value is not JSON-representable");
            Value::Null
        })
    }
}

impl<T: StoreValue> ErasedStore for StoreInner<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn export(&self) -> Option<StoreState> {
        if !self.exportable {
            return None;
        }
        let value = self.signal.get_untracked();
        match serde_json::to_value(&value) {
            Ok(value) => Some(StoreState::new(
                value,
                self.signal.version(),
                self.updated_at.load(Ordering::Acquire),
            )),
            Err(err) => {
                warn!(store = %self.name, error = %err, "skipping store that is not JSON-representable");
                None
            }
        }
    }

    fn hydrate(self: Arc<Self>, state: &StoreState, mode: RestoreMode) -> HydrateOutcome {
        let current = self.signal.version();
        if mode == RestoreMode::Monotonic && state.version < current {
            debug!(
                store = %self.name,
                snapshot_version = state.version,
                version = current,
                "ignoring stale snapshot entry"
            );
            return HydrateOutcome::Stale;
        }

        let value = match serde_json::from_value::<T>(state.value.clone()) {
            Ok(value) => value,
            Err(err) => {
                warn!(store = %self.name, error = %err, "snapshot value does not match store type");
                return HydrateOutcome::Invalid;
            }
        };

        let (origin, min_version) = match mode {
            RestoreMode::Monotonic => (UpdateOrigin::Hydrate, state.version),
            RestoreMode::Force => (UpdateOrigin::Replay, 0),
        };
        let timestamp = state.timestamp;
        let runtime = self.signal.runtime().clone();
        runtime.run_write(move || self.commit(value, origin, min_version, Some(timestamp)));
        HydrateOutcome::Applied
    }

    fn go_live(&self) {
        self.advance(HydrationState::Live);
    }

    fn hydration_state(&self) -> HydrationState {
        *self.hydration.lock()
    }
}

/// A named, middleware-guarded, optionally persisted reactive value.
///
/// # Example
///
/// ```rust
/// use eghact_reactive::store::{middleware, Registry, Store, StoreOptions};
///
/// let registry = Registry::new();
/// let quantity = Store::new(
///     &registry,
///     "quantity",
///     1u32,
///     StoreOptions::new().middleware(middleware::validate(|q: &u32| *q <= 10)),
/// )
/// .unwrap();
///
/// quantity.set(3).unwrap();
/// quantity.set(99).unwrap(); // vetoed
/// assert_eq!(quantity.get(), 3);
/// assert_eq!(quantity.version(), 1);
/// ```
pub struct Store<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T: StoreValue> Store<T> {
    /// Create a store in `registry`, or get the existing one per the
    /// registry's [`DuplicatePolicy`](crate::config::DuplicatePolicy).
    ///
    /// When an existing store is returned, `default` and `options` are ignored.
    pub fn new(
        registry: &Registry,
        name: impl Into<String>,
        default: T,
        options: StoreOptions<T>,
    ) -> Result<Self> {
        let name = name.into();
        let inner = registry.register(&name, || {
            Arc::new(StoreInner::new(registry, name.clone(), default, options))
        })?;
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<StoreInner<T>>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Get the current value (tracked inside computeds and effects).
    pub fn get(&self) -> T {
        self.inner.signal.get()
    }

    pub fn get_untracked(&self) -> T {
        self.inner.signal.get_untracked()
    }

    /// Borrow the current value (tracked). `f` must not write to this store.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.inner.signal.with(f)
    }

    /// Number of committed changes, including restores.
    pub fn version(&self) -> u64 {
        self.inner.signal.version()
    }

    /// Replace the value.
    ///
    /// Returns the first middleware error, if any; the store is unchanged in
    /// that case. A veto is not an error.
    pub fn set(&self, value: T) -> Result<()> {
        self.write(move |_| value)
    }

    /// Replace the value with a function of the latest one.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> Result<()> {
        self.write(f)
    }

    fn write(&self, make: impl FnOnce(&T) -> T) -> Result<()> {
        let inner = &self.inner;
        let previous = inner.latest();
        let candidate = make(&previous);
        let chain = inner.middleware.read().clone();
        let next = run_chain(&chain, candidate, &previous, &inner.name)?;

        if next == previous {
            debug!(store = %inner.name, "write vetoed or unchanged");
            return Ok(());
        }

        inner.stage(next.clone());
        let target = Arc::clone(inner);
        inner
            .signal
            .runtime()
            .run_write(move || target.commit(next, UpdateOrigin::Local, 0, None));
        Ok(())
    }

    /// Register a callback invoked with the new value after every change.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.inner.signal.subscribe(callback)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.signal.subscriber_count()
    }

    /// Append a middleware after the ones given at construction.
    pub fn use_middleware(&self, middleware: impl Middleware<T> + 'static) {
        self.inner.middleware.write().push(Arc::new(middleware));
    }

    pub fn middleware_count(&self) -> usize {
        self.inner.middleware.read().len()
    }

    pub fn hydration_state(&self) -> HydrationState {
        self.inner.hydration_state()
    }

    /// Creation time in milliseconds.
    pub fn created_at(&self) -> u64 {
        self.inner.created_at
    }

    /// Time of the last committed change in milliseconds.
    pub fn updated_at(&self) -> u64 {
        self.inner.updated_at.load(Ordering::Acquire)
    }

    pub fn is_exportable(&self) -> bool {
        self.inner.exportable
    }

    pub fn is_persistent(&self) -> bool {
        self.inner.storage.is_some()
    }

    pub fn runtime(&self) -> &Runtime {
        self.inner.signal.runtime()
    }
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Store<T>
where
    T: StoreValue + Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.name())
            .field("value", &self.get_untracked())
            .field("version", &self.version())
            .field("hydration", &self.hydration_state())
            .finish()
    }
}
