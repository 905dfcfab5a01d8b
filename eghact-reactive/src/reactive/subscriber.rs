//! Subscriber bookkeeping for the reactive system.
//!
//! Every reactive unit that exposes `subscribe` owns a [`SubscriberList`].
//! Subscribing hands back a [`Subscription`], the cancellation handle.
//!
//! Cancellation is checked at dispatch time: the list snapshots its entries
//! before invoking callbacks, and each entry's active flag is re-read right
//! before its callback runs. A subscription cancelled by an earlier callback
//! in the same pass is therefore skipped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;

/// Unique identifier for a subscriber.
///
/// Each subscriber (computed, effect, or user callback) gets a unique ID when
/// created. The ID keys observer sets and deduplicates scheduled reactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    id: SubscriberId,
    active: Arc<AtomicBool>,
    callback: Callback<T>,
}

/// Removes a cancelled entry from its owning list.
trait Detach: Send + Sync {
    fn detach(&self, id: SubscriberId);
}

struct Slots<T> {
    entries: Mutex<Vec<Entry<T>>>,
}

impl<T: 'static> Detach for Slots<T> {
    fn detach(&self, id: SubscriberId) {
        self.entries.lock().retain(|entry| entry.id != id);
    }
}

/// Ordered list of value callbacks attached to one reactive unit.
pub(crate) struct SubscriberList<T> {
    slots: Arc<Slots<T>>,
}

impl<T: 'static> SubscriberList<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Arc::new(Slots {
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Append a callback. Callbacks fire oldest first.
    pub(crate) fn add<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriberId::new();
        let active = Arc::new(AtomicBool::new(true));
        self.slots.entries.lock().push(Entry {
            id,
            active: Arc::clone(&active),
            callback: Arc::new(callback),
        });

        let slots: Arc<dyn Detach> = self.slots.clone();
        Subscription {
            id,
            active,
            owner: Arc::downgrade(&slots),
        }
    }

    /// Invoke every active callback with `value`.
    ///
    /// The entry lock is released before any callback runs, so callbacks are
    /// free to subscribe, cancel, or write to other signals.
    pub(crate) fn dispatch(&self, value: &T) {
        let pending: SmallVec<[(Arc<AtomicBool>, Callback<T>); 4]> = self
            .slots
            .entries
            .lock()
            .iter()
            .map(|entry| (Arc::clone(&entry.active), Arc::clone(&entry.callback)))
            .collect();

        for (active, callback) in pending {
            if active.load(Ordering::Acquire) {
                callback(value);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.entries.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.entries.lock().is_empty()
    }

    /// Deactivate and drop every entry.
    pub(crate) fn clear(&self) {
        let drained: Vec<Entry<T>> = std::mem::take(&mut *self.slots.entries.lock());
        for entry in drained {
            entry.active.store(false, Ordering::Release);
        }
    }
}

/// Cancellation handle returned by `subscribe`.
///
/// Dropping the handle does not cancel the subscription; call
/// [`Subscription::cancel`]. Cancelling is idempotent.
pub struct Subscription {
    id: SubscriberId,
    active: Arc<AtomicBool>,
    owner: Weak<dyn Detach>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Whether the callback can still fire.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop the callback from firing again, including for a dispatch pass
    /// that is already under way.
    pub fn cancel(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Some(owner) = self.owner.upgrade() {
                owner.detach(self.id);
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
