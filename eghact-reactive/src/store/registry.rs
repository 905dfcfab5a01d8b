//! Store Registry
//!
//! The registry is the application-scoped map from store names to stores.
//! It is an explicit object: every store is created against one, and
//! dropping the registry (and the store handles) tears everything down.
//!
//! The registry also owns what is shared between its stores:
//!
//! - the reactive [`Runtime`] they propagate through,
//! - the [`Clock`] used for timestamps,
//! - the configuration and its snapshot fingerprint,
//! - the devtools observers that receive every [`UpdateEvent`](crate::devtools::UpdateEvent).
//!
//! Snapshot capture and restore live here since they span all stores.

use std::any::{type_name, Any};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use super::store::{HydrationState, Store, StoreInner, StoreValue};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigFingerprint, DuplicatePolicy, RegistryConfig};
use crate::devtools::{ObserverHub, ObserverId, StoreObserver};
use crate::error::{Result, StateError};
use crate::reactive::Runtime;
use crate::snapshot::{HydrateOutcome, RestoreMode, RestoreReport, Snapshot, StoreState, CONFIG_KEY};

/// Type-erased view of a store, enough to snapshot and restore it.
pub(crate) trait ErasedStore: Send + Sync {
    fn name(&self) -> &str;
    fn type_name(&self) -> &'static str;
    fn export(&self) -> Option<StoreState>;
    fn hydrate(self: Arc<Self>, state: &StoreState, mode: RestoreMode) -> HydrateOutcome;
    fn go_live(&self);
    fn hydration_state(&self) -> HydrationState;
}

struct Entry {
    erased: Arc<dyn ErasedStore>,
    typed: Arc<dyn Any + Send + Sync>,
}

struct RegistryInner {
    runtime: Runtime,
    clock: Arc<dyn Clock>,
    hub: Arc<ObserverHub>,
    config: RwLock<RegistryConfig>,
    stores: RwLock<IndexMap<String, Entry>>,
}

/// Application-scoped collection of named stores.
///
/// Cloning shares the registry.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

/// Non-owning reference to a [`Registry`].
#[derive(Clone)]
pub struct WeakRegistry {
    inner: Weak<RegistryInner>,
}

impl WeakRegistry {
    pub fn upgrade(&self) -> Option<Registry> {
        self.inner.upgrade().map(|inner| Registry { inner })
    }
}

/// Builder for [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
    runtime: Option<Runtime>,
    clock: Option<Arc<dyn Clock>>,
    config: RegistryConfig,
    observers: Vec<Arc<dyn StoreObserver>>,
}

impl RegistryBuilder {
    /// Share an existing runtime instead of creating one.
    pub fn runtime(mut self, runtime: Runtime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.config.duplicate_policy = policy;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn StoreObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> Registry {
        let hub = Arc::new(ObserverHub::default());
        for observer in self.observers {
            hub.add(observer);
        }
        Registry {
            inner: Arc::new(RegistryInner {
                runtime: self.runtime.unwrap_or_default(),
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                hub,
                config: RwLock::new(self.config),
                stores: RwLock::new(IndexMap::new()),
            }),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// A registry with its own runtime, the system clock and default config.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub(crate) fn hub(&self) -> &Arc<ObserverHub> {
        &self.inner.hub
    }

    /// Current time according to the registry's clock.
    pub fn now_ms(&self) -> u64 {
        self.inner.clock.now_ms()
    }

    pub fn downgrade(&self) -> WeakRegistry {
        WeakRegistry {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Run `f` as one propagation pass (see [`Runtime::batch`]).
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.runtime.batch(f)
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    pub fn config(&self) -> RegistryConfig {
        self.inner.config.read().clone()
    }

    pub fn set_config(&self, config: RegistryConfig) {
        *self.inner.config.write() = config;
    }

    /// The part of the configuration carried by snapshots.
    pub fn fingerprint(&self) -> ConfigFingerprint {
        self.inner.config.read().fingerprint()
    }

    // ------------------------------------------------------------------
    // Stores
    // ------------------------------------------------------------------

    /// Insert the store produced by `build` under `name`, or resolve the
    /// name clash per the duplicate policy.
    pub(crate) fn register<T: StoreValue>(
        &self,
        name: &str,
        build: impl FnOnce() -> Arc<StoreInner<T>>,
    ) -> Result<Arc<StoreInner<T>>> {
        if name == CONFIG_KEY {
            return Err(StateError::Config(format!(
                "store name `{CONFIG_KEY}` is reserved"
            )));
        }

        let policy = self.inner.config.read().duplicate_policy;
        if let Some(entry) = self.inner.stores.read().get(name) {
            return resolve_existing(name, entry, policy);
        }

        // No lock held: a persistence backend may call back into the registry.
        let store = build();

        let mut stores = self.inner.stores.write();
        if let Some(entry) = stores.get(name) {
            debug!(store = %name, "store registered concurrently; dropping the new one");
            return resolve_existing(name, entry, policy);
        }
        stores.insert(
            name.to_string(),
            Entry {
                erased: store.clone(),
                typed: store.clone(),
            },
        );
        debug!(store = %name, value_type = type_name::<T>(), "store registered");
        Ok(store)
    }

    /// Look up a store by name.
    ///
    /// Fails with [`StateError::TypeMismatch`] if the store holds another type.
    pub fn store<T: StoreValue>(&self, name: &str) -> Result<Option<Store<T>>> {
        let stores = self.inner.stores.read();
        match stores.get(name) {
            Some(entry) => downcast(name, entry).map(|inner| Some(Store::from_inner(inner))),
            None => Ok(None),
        }
    }

    /// Registered store names, in creation order.
    pub fn names(&self) -> Vec<String> {
        self.inner.stores.read().keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.stores.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.stores.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.stores.read().is_empty()
    }

    /// Forget a store. Existing handles keep working but the store is no
    /// longer captured or restored.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.inner.stores.write().shift_remove(name).is_some();
        if removed {
            debug!(store = %name, "store removed");
        }
        removed
    }

    pub fn hydration_state(&self, name: &str) -> Option<HydrationState> {
        self.erased(name).map(|store| store.hydration_state())
    }

    /// Mark every store `Live`; hydration is over.
    pub fn go_live(&self) {
        for store in self.erased_all() {
            store.go_live();
        }
    }

    fn erased(&self, name: &str) -> Option<Arc<dyn ErasedStore>> {
        self.inner
            .stores
            .read()
            .get(name)
            .map(|entry| Arc::clone(&entry.erased))
    }

    fn erased_all(&self) -> Vec<Arc<dyn ErasedStore>> {
        self.inner
            .stores
            .read()
            .values()
            .map(|entry| Arc::clone(&entry.erased))
            .collect()
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    pub fn add_observer(&self, observer: Arc<dyn StoreObserver>) -> ObserverId {
        self.inner.hub.add(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.inner.hub.remove(id)
    }

    pub fn observer_count(&self) -> usize {
        self.inner.hub.len()
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Capture every exportable store plus the configuration fingerprint.
    pub fn capture(&self) -> Snapshot {
        let mut snapshot = Snapshot::new().with_config(self.fingerprint());
        for store in self.erased_all() {
            if let Some(state) = store.export() {
                snapshot.insert(store.name(), state);
            }
        }
        snapshot
    }

    /// Hydrate from `snapshot`, skipping entries older than their store.
    pub fn restore(&self, snapshot: &Snapshot) -> RestoreReport {
        self.restore_with(snapshot, RestoreMode::Monotonic)
    }

    /// Apply `snapshot` in one propagation pass.
    ///
    /// Never fails: unknown names, stale entries and undecodable values are
    /// listed in the report. Restores bypass middleware and are never saved
    /// to persistence, but subscribers and observers are notified.
    pub fn restore_with(&self, snapshot: &Snapshot, mode: RestoreMode) -> RestoreReport {
        let mut report = RestoreReport::default();
        if let Some(patch) = snapshot.config() {
            report.config_changed = patch.apply_to(&mut self.inner.config.write());
        }

        self.inner.runtime.batch(|| {
            for (name, state) in snapshot.stores() {
                match self.erased(name) {
                    Some(store) => report.record(name, store.hydrate(state, mode)),
                    None => {
                        debug!(store = %name, "snapshot entry has no registered store");
                        report.unknown.push(name.to_string());
                    }
                }
            }
        });

        debug!(
            ?mode,
            applied = report.applied.len(),
            stale = report.stale.len(),
            unknown = report.unknown.len(),
            invalid = report.invalid.len(),
            config_changed = report.config_changed,
            "snapshot restored"
        );
        report
    }

    /// Hydrate from snapshot JSON. Unparseable input restores nothing.
    pub fn restore_json(&self, text: &str) -> RestoreReport {
        match Snapshot::from_json(text) {
            Ok(snapshot) => self.restore(&snapshot),
            Err(err) => {
                warn!(error = %err, "ignoring unreadable snapshot");
                RestoreReport::default()
            }
        }
    }

    /// Devtools view of [`capture`](Self::capture).
    pub fn get_state(&self) -> Value {
        match self.capture().to_value() {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "snapshot could not be encoded");
                Value::Object(Default::default())
            }
        }
    }

    /// Devtools counterpart of [`get_state`](Self::get_state): a forced
    /// restore that ignores versions.
    pub fn set_state(&self, state: Value) -> RestoreReport {
        match Snapshot::from_value(state) {
            Ok(snapshot) => self.restore_with(&snapshot, RestoreMode::Force),
            Err(err) => {
                warn!(error = %err, "ignoring unreadable state");
                RestoreReport::default()
            }
        }
    }
}

fn resolve_existing<T: StoreValue>(
    name: &str,
    entry: &Entry,
    policy: DuplicatePolicy,
) -> Result<Arc<StoreInner<T>>> {
    match policy {
        DuplicatePolicy::Reject => Err(StateError::DuplicateStore(name.to_string())),
        DuplicatePolicy::ReturnExisting => {
            debug!(store = %name, "returning existing store");
            downcast(name, entry)
        }
    }
}

fn downcast<T: StoreValue>(name: &str, entry: &Entry) -> Result<Arc<StoreInner<T>>> {
    Arc::clone(&entry.typed)
        .downcast::<StoreInner<T>>()
        .map_err(|_| StateError::TypeMismatch {
            name: name.to_string(),
            existing: entry.erased.type_name(),
            requested: type_name::<T>(),
        })
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("stores", &self.names())
            .field("observers", &self.observer_count())
            .field("config", &*self.inner.config.read())
            .finish()
    }
}
