//! Restore bookkeeping.

use serde::Serialize;

/// How a snapshot is applied to existing stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestoreMode {
    /// Apply an entry only if its version is at least the store's current
    /// version. Used for hydration.
    #[default]
    Monotonic,
    /// Apply every entry regardless of version. Used for time travel and
    /// devtools `set_state`. Store versions still only move forward.
    Force,
}

/// What happened to one snapshot entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrateOutcome {
    Applied,
    /// The store already holds newer state.
    Stale,
    /// The value does not decode to the store's type.
    Invalid,
}

/// Summary of a restore. Restores never fail; problems are listed here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    /// Stores whose value was written from the snapshot.
    pub applied: Vec<String>,
    /// Entries older than the store they target.
    pub stale: Vec<String>,
    /// Entries naming no registered store.
    pub unknown: Vec<String>,
    /// Entries whose value could not be decoded.
    pub invalid: Vec<String>,
    /// Whether `__config` changed the registry configuration.
    pub config_changed: bool,
}

impl RestoreReport {
    pub(crate) fn record(&mut self, name: &str, outcome: HydrateOutcome) {
        let bucket = match outcome {
            HydrateOutcome::Applied => &mut self.applied,
            HydrateOutcome::Stale => &mut self.stale,
            HydrateOutcome::Invalid => &mut self.invalid,
        };
        bucket.push(name.to_string());
    }

    /// True when every entry in the snapshot was applied.
    pub fn is_complete(&self) -> bool {
        self.stale.is_empty() && self.unknown.is_empty() && self.invalid.is_empty()
    }
}
