//! Error types for the propagation engine.
//!
//! Only a handful of operations can fail from the caller's point of view:
//! store creation (name policy), store writes (middleware), and computed
//! reads (evaluation). Persistence and hydration problems are logged and
//! swallowed; they never show up here unless a caller asks for them
//! explicitly (e.g. by calling a persistence backend directly).

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors produced by signals, stores and the snapshot codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// A store with this name already exists and the registry rejects duplicates.
    #[error("store `{0}` is already registered")]
    DuplicateStore(String),

    /// A store with this name exists but holds a different value type.
    #[error("store `{name}` is registered with value type `{existing}`, not `{requested}`")]
    TypeMismatch {
        name: String,
        existing: &'static str,
        requested: &'static str,
    },

    /// A middleware aborted a write.
    #[error("middleware rejected write to `{store}`: {reason}")]
    Middleware { store: String, reason: String },

    /// A computed signal's evaluation function failed.
    #[error("computation failed: {0}")]
    Compute(String),

    /// A computed signal read itself while evaluating.
    #[error("cyclic dependency while evaluating computed #{0}")]
    Cycle(u64),

    /// Encoding or decoding a snapshot or store value failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// A persistence backend failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Configuration could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// The owning registry or unit has been dropped.
    #[error("`{0}` has been disposed")]
    Disposed(String),
}

impl StateError {
    /// Wrap any displayable failure as a computation error.
    pub fn compute(err: impl std::fmt::Display) -> Self {
        Self::Compute(err.to_string())
    }

    /// Build a middleware rejection for the given store.
    pub fn middleware(store: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Middleware {
            store: store.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StateError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StateError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<std::io::Error> for StateError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}
