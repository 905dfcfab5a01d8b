//! Registry configuration.
//!
//! Configuration is plain data with serde defaults so it can be embedded in
//! an application's own config file or loaded from a JSON string.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StateError};

/// Default number of entries kept by a history recorder.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// What happens when a store is created under a name that is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Hand back the existing store (its value is kept, the new default is ignored).
    #[default]
    ReturnExisting,
    /// Fail with [`StateError::DuplicateStore`].
    Reject,
}

/// Configuration for a [`Registry`](crate::store::Registry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub duplicate_policy: DuplicatePolicy,
    pub history_capacity: usize,
    pub default_key: String,
    pub supported_keys: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            duplicate_policy: DuplicatePolicy::default(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            default_key: "en".to_string(),
            supported_keys: vec!["en".to_string()],
        }
    }
}

impl RegistryConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| StateError::Config(e.to_string()))
    }

    /// The part of the configuration that travels inside snapshots.
    pub fn fingerprint(&self) -> ConfigFingerprint {
        ConfigFingerprint {
            default_key: self.default_key.clone(),
            supported_keys: self.supported_keys.clone(),
        }
    }
}

/// Configuration fingerprint captured alongside store state (`__config`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFingerprint {
    pub default_key: String,
    pub supported_keys: Vec<String>,
}

/// A possibly incomplete fingerprint as received from the wire.
///
/// Fields that are absent (or malformed) leave the receiving side's values
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_keys: Option<Vec<String>>,
}

impl ConfigPatch {
    /// Lenient decode: each field is taken only if it has the right shape.
    pub fn from_value(value: &serde_json::Value) -> Self {
        let default_key = value
            .get("defaultKey")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let supported_keys = value
            .get("supportedKeys")
            .and_then(|v| v.as_array())
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| k.as_str().map(str::to_string))
                    .collect()
            });
        Self {
            default_key,
            supported_keys,
        }
    }

    /// Apply the fields that are present. Returns true if anything changed.
    pub fn apply_to(&self, config: &mut RegistryConfig) -> bool {
        let mut changed = false;
        if let Some(key) = &self.default_key {
            changed |= config.default_key != *key;
            config.default_key = key.clone();
        }
        if let Some(keys) = &self.supported_keys {
            changed |= config.supported_keys != *keys;
            config.supported_keys = keys.clone();
        }
        changed
    }
}

impl From<ConfigFingerprint> for ConfigPatch {
    fn from(fp: ConfigFingerprint) -> Self {
        Self {
            default_key: Some(fp.default_key),
            supported_keys: Some(fp.supported_keys),
        }
    }
}
