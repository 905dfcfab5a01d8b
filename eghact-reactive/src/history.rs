//! Time-travel history of store changes.
//!
//! A [`HistoryRecorder`] attaches to a registry as an observer and appends
//! one [`HistoryEntry`] per store change, each carrying a full snapshot of
//! the registry taken right after the change. Any entry can therefore be
//! replayed on its own.
//!
//! Entries live in a bounded ring buffer: when full, the oldest entry is
//! dropped whole. Changes caused by [`HistoryRecorder::time_travel`] (and any
//! other forced restore) are not recorded.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use eghact_reactive::clock::ManualClock;
//! use eghact_reactive::history::HistoryRecorder;
//! use eghact_reactive::store::{Registry, Store, StoreOptions};
//!
//! let clock = Arc::new(ManualClock::new(0));
//! let registry = Registry::builder().clock(clock.clone()).build();
//! let history = HistoryRecorder::attach(&registry, 10);
//! let count = Store::new(&registry, "count", 0, StoreOptions::new()).unwrap();
//!
//! count.set(1).unwrap();
//! let checkpoint = clock.advance(1_000);
//! count.set(2).unwrap();
//!
//! assert!(history.time_travel(checkpoint - 1));
//! assert_eq!(count.get(), 1);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::devtools::{ObserverId, StoreObserver, UpdateEvent, UpdateOrigin};
use crate::error::Result;
use crate::snapshot::{RestoreMode, Snapshot};
use crate::store::{Registry, WeakRegistry};

/// One recorded change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Registry clock time at which the change was recorded.
    pub timestamp: u64,
    pub store_name: String,
    pub previous: Value,
    pub next: Value,
    /// Full registry state right after the change.
    pub state: Snapshot,
}

struct Recorder {
    registry: WeakRegistry,
    capacity: usize,
    entries: Mutex<VecDeque<HistoryEntry>>,
}

impl StoreObserver for Recorder {
    fn on_update(&self, event: &UpdateEvent) {
        if event.origin == UpdateOrigin::Replay {
            return;
        }
        let Some(registry) = self.registry.upgrade() else {
            return;
        };

        let entry = HistoryEntry {
            timestamp: registry.now_ms(),
            store_name: event.store_name.clone(),
            previous: event.previous_value.clone(),
            next: event.next_value.clone(),
            state: registry.capture(),
        };

        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        trace!(store = %event.store_name, len = entries.len(), "history entry recorded");
    }
}

/// Bounded log of store changes with time travel.
pub struct HistoryRecorder {
    recorder: Arc<Recorder>,
    observer: ObserverId,
}

impl HistoryRecorder {
    /// Start recording every store in `registry`, including stores created
    /// later. `capacity` is clamped to at least one entry.
    pub fn attach(registry: &Registry, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let recorder = Arc::new(Recorder {
            registry: registry.downgrade(),
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        });
        let observer = registry.add_observer(recorder.clone());
        debug!(capacity, "history recorder attached");
        Self { recorder, observer }
    }

    /// Attach with the registry's configured `history_capacity`.
    pub fn attach_default(registry: &Registry) -> Self {
        Self::attach(registry, registry.config().history_capacity)
    }

    pub fn capacity(&self) -> usize {
        self.recorder.capacity
    }

    /// Entries, oldest first.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.recorder.entries.lock().iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<HistoryEntry> {
        self.recorder.entries.lock().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.recorder.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorder.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.recorder.entries.lock().clear();
    }

    /// Restore the newest entry recorded at or before `timestamp`.
    ///
    /// The restore is forced: it ignores versions and is not itself
    /// recorded. Returns false if no such entry exists or the registry is
    /// gone.
    pub fn time_travel(&self, timestamp: u64) -> bool {
        let state = {
            let entries = self.recorder.entries.lock();
            match entries.iter().rev().find(|entry| entry.timestamp <= timestamp) {
                Some(entry) => entry.state.clone(),
                None => return false,
            }
        };
        let Some(registry) = self.recorder.registry.upgrade() else {
            return false;
        };

        let report = registry.restore_with(&state, RestoreMode::Force);
        debug!(timestamp, applied = report.applied.len(), "time travel");
        true
    }

    /// Serialize the recorded session, oldest entry first.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.entries())?)
    }

    /// Stop recording. Recorded entries are kept.
    pub fn detach(&self) -> bool {
        match self.recorder.registry.upgrade() {
            Some(registry) => registry.remove_observer(self.observer),
            None => false,
        }
    }
}

impl Drop for HistoryRecorder {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for HistoryRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryRecorder")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}
