//! Eghact Reactive
//!
//! This crate provides the state engine of the Eghact UI framework.
//! It implements:
//!
//! - Reactive primitives (signals, computeds, effects)
//! - Named stores with middleware and persistence
//! - Snapshot capture/restore for server-to-client hydration
//! - A bounded history recorder with time travel
//!
//! Propagation is synchronous and glitch-free: when a write returns, every
//! computed, effect and subscriber that depends on it has seen one
//! consistent state.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: runtime, signals, computeds, effects and subscriptions
//! - `store`: stores, derived stores, middleware, persistence and the registry
//! - `snapshot`: the snapshot type and its JSON/MessagePack codecs
//! - `history`: time-travel recorder
//! - `devtools`: the observer interface for inspectors
//!
//! # Example
//!
//! ```rust
//! use eghact_reactive::store::{Registry, Store, StoreOptions};
//!
//! // Server side: render, then ship the state.
//! let server = Registry::new();
//! let locale = Store::new(&server, "locale", "en".to_string(), StoreOptions::new()).unwrap();
//! locale.set("es".to_string()).unwrap();
//! let payload = server.capture().to_embedded_json().unwrap();
//!
//! // Client side: same stores, hydrated from the payload.
//! let client = Registry::new();
//! let locale = Store::new(&client, "locale", "en".to_string(), StoreOptions::new()).unwrap();
//! client.restore_json(&payload);
//! assert_eq!(locale.get(), "es");
//! ```

pub mod clock;
pub mod config;
pub mod devtools;
pub mod error;
pub mod history;
pub mod reactive;
pub mod snapshot;
pub mod store;

pub use config::{DuplicatePolicy, RegistryConfig};
pub use error::{Result, StateError};
pub use history::{HistoryEntry, HistoryRecorder};
pub use reactive::{Computed, Effect, Runtime, Signal, Subscription};
pub use snapshot::{RestoreMode, RestoreReport, Snapshot, StoreState};
pub use store::{DerivedStore, Registry, Store, StoreOptions};
