//! Devtools observer interface.
//!
//! A registry broadcasts one [`UpdateEvent`] per store change to every
//! observer injected into it. Observers run synchronously inside the write,
//! after the store's own subscribers. Together with
//! [`Registry::get_state`](crate::store::Registry::get_state) and
//! [`Registry::set_state`](crate::store::Registry::set_state) this is the
//! surface an inspector needs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Why a store changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOrigin {
    /// An ordinary `set`/`update`.
    Local,
    /// A monotonic snapshot restore (hydration).
    Hydrate,
    /// A forced restore (time travel or devtools `set_state`).
    Replay,
}

/// One store change, as seen by observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "update", rename_all = "camelCase")]
pub struct UpdateEvent {
    pub store_name: String,
    pub previous_value: Value,
    pub next_value: Value,
    pub origin: UpdateOrigin,
    pub version: u64,
    pub timestamp: u64,
}

impl UpdateEvent {
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Receives every store change in a registry.
pub trait StoreObserver: Send + Sync {
    fn on_update(&self, event: &UpdateEvent);
}

impl<F> StoreObserver for F
where
    F: Fn(&UpdateEvent) + Send + Sync,
{
    fn on_update(&self, event: &UpdateEvent) {
        self(event)
    }
}

/// Handle for removing an observer from a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl ObserverId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// The observers of one registry, shared with each of its stores.
#[derive(Default)]
pub(crate) struct ObserverHub {
    observers: RwLock<Vec<(ObserverId, Arc<dyn StoreObserver>)>>,
}

impl ObserverHub {
    pub(crate) fn add(&self, observer: Arc<dyn StoreObserver>) -> ObserverId {
        let id = ObserverId::next();
        self.observers.write().push((id, observer));
        id
    }

    pub(crate) fn remove(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// Deliver an event built by `make`. `make` only runs if someone listens.
    pub(crate) fn broadcast(&self, make: impl FnOnce() -> UpdateEvent) {
        let observers: Vec<Arc<dyn StoreObserver>> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        if observers.is_empty() {
            return;
        }
        let event = make();
        for observer in observers {
            observer.on_update(&event);
        }
    }
}

/// Keeps every event it sees. Handy in tests and for dumping a session.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<UpdateEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UpdateEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl StoreObserver for EventLog {
    fn on_update(&self, event: &UpdateEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Forwards events to an async consumer, e.g. a devtools bridge task.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<UpdateEvent>,
}

impl StoreObserver for ChannelObserver {
    fn on_update(&self, event: &UpdateEvent) {
        // A closed receiver just means nobody is listening anymore.
        let _ = self.tx.send(event.clone());
    }
}

/// Create an observer and the receiver it forwards to.
pub fn channel() -> (ChannelObserver, mpsc::UnboundedReceiver<UpdateEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelObserver { tx }, rx)
}
