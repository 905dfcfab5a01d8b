//! Snapshot Codec
//!
//! A snapshot is the state of every exportable store in a registry, plus the
//! configuration fingerprint that was active when it was captured. It is the
//! contract between a server that renders with some state and a client that
//! hydrates from it.
//!
//! # Wire Format
//!
//! ```json
//! {
//!   "cart":   { "value": [], "version": 0, "timestamp": 1700000000000 },
//!   "locale": { "value": "es", "version": 1, "timestamp": 1700000000123 },
//!   "__config": { "defaultKey": "en", "supportedKeys": ["en", "es"] }
//! }
//! ```
//!
//! Store entries are written in name order and `__config` comes last, so the
//! same state always encodes to the same bytes.
//!
//! # Leniency
//!
//! Decoding fails only when the input is not an object at all. Entries with
//! the wrong shape are dropped with a warning, missing `version`/`timestamp`
//! default to 0, and a missing or partial `__config` leaves the receiving
//! configuration alone.

mod restore;

pub use restore::{HydrateOutcome, RestoreMode, RestoreReport};

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::warn;

use crate::config::ConfigPatch;
use crate::error::{Result, StateError};

/// Key under which the configuration fingerprint travels.
pub const CONFIG_KEY: &str = "__config";

/// Largest encoded snapshot accepted by the decoders.
pub const MAX_SNAPSHOT_BYTES: usize = 64 * 1024 * 1024;

/// One store's entry in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    pub value: Value,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub timestamp: u64,
}

impl StoreState {
    pub fn new(value: Value, version: u64, timestamp: u64) -> Self {
        Self {
            value,
            version,
            timestamp,
        }
    }
}

/// Captured state of a registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    stores: BTreeMap<String, StoreState>,
    config: Option<ConfigPatch>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, state: StoreState) -> Option<StoreState> {
        self.stores.insert(name.into(), state)
    }

    pub fn remove(&mut self, name: &str) -> Option<StoreState> {
        self.stores.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&StoreState> {
        self.stores.get(name)
    }

    /// Store entries in name order.
    pub fn stores(&self) -> impl Iterator<Item = (&str, &StoreState)> {
        self.stores.iter().map(|(name, state)| (name.as_str(), state))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stores.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub fn config(&self) -> Option<&ConfigPatch> {
        self.config.as_ref()
    }

    pub fn set_config(&mut self, config: Option<ConfigPatch>) {
        self.config = config;
    }

    pub fn with_config(mut self, config: impl Into<ConfigPatch>) -> Self {
        self.config = Some(config.into());
        self
    }

    /// Decode from a JSON value, skipping malformed entries.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(StateError::Codec(format!(
                "snapshot must be a JSON object, got {}",
                kind(&value)
            )));
        };
        Ok(Self::from_map(map))
    }

    fn from_map(map: Map<String, Value>) -> Self {
        let mut snapshot = Self::new();
        for (name, entry) in map {
            if name == CONFIG_KEY {
                snapshot.config = Some(ConfigPatch::from_value(&entry));
                continue;
            }
            match serde_json::from_value::<StoreState>(entry) {
                Ok(state) => {
                    snapshot.stores.insert(name, state);
                }
                Err(err) => warn!(store = %name, error = %err, "skipping malformed snapshot entry"),
            }
        }
        snapshot
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Compact JSON, byte-stable for equal snapshots.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// JSON that can be placed inside an HTML `<script>` element as-is.
    ///
    /// `<`, `>`, `&`, U+2028 and U+2029 are written as `\uXXXX` escapes.
    /// Those characters only occur inside JSON strings, where the escapes
    /// decode back to the same text.
    pub fn to_embedded_json(&self) -> Result<String> {
        let json = self.to_json()?;
        let mut out = String::with_capacity(json.len());
        for c in json.chars() {
            match c {
                '<' => out.push_str("\\u003c"),
                '>' => out.push_str("\\u003e"),
                '&' => out.push_str("\\u0026"),
                '\u{2028}' => out.push_str("\\u2028"),
                '\u{2029}' => out.push_str("\\u2029"),
                c => out.push(c),
            }
        }
        Ok(out)
    }

    /// Decode from JSON text. Fails only if the text is not a JSON object.
    pub fn from_json(text: &str) -> Result<Self> {
        check_size(text.len())?;
        Self::from_value(serde_json::from_str(text)?)
    }

    /// Compact binary encoding (MessagePack, named fields).
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        check_size(bytes.len())?;
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

fn check_size(len: usize) -> Result<()> {
    if len > MAX_SNAPSHOT_BYTES {
        return Err(StateError::Codec(format!(
            "snapshot is {len} bytes (limit {MAX_SNAPSHOT_BYTES})"
        )));
    }
    Ok(())
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let len = self.stores.len() + usize::from(self.config.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        for (name, state) in &self.stores {
            map.serialize_entry(name, state)?;
        }
        if let Some(config) = &self.config {
            map.serialize_entry(CONFIG_KEY, config)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Snapshot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Snapshot::from_value(value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use serde_json::json;

    fn sample() -> Snapshot {
        let mut snapshot = Snapshot::new().with_config(RegistryConfig::default().fingerprint());
        snapshot.insert("locale", StoreState::new(json!("es"), 1, 1_000));
        snapshot.insert("cart", StoreState::new(json!([{ "qty": 2, "sku": "a1" }]), 3, 900));
        snapshot
    }

    #[test]
    fn json_is_sorted_with_config_last() {
        let json = sample().to_json().unwrap();
        assert_eq!(
            json,
            r#"{"cart":{"value":[{"qty":2,"sku":"a1"}],"version":3,"timestamp":900},"locale":{"value":"es","version":1,"timestamp":1000},"__config":{"defaultKey":"en","supportedKeys":["en"]}}"#
        );
    }

    #[test]
    fn encoding_is_byte_stable() {
        let a = sample();
        let b = Snapshot::from_json(&a.to_json().unwrap()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let snapshot = Snapshot::from_json(
            r#"{ "ok": { "value": 1 }, "bad": 7, "worse": { "value": 1, "version": "two" } }"#,
        )
        .unwrap();

        assert_eq!(snapshot.names().collect::<Vec<_>>(), vec!["ok"]);
        assert_eq!(snapshot.get("ok").unwrap().version, 0);
        assert!(snapshot.config().is_none());
    }

    #[test]
    fn non_object_input_is_rejected() {
        assert!(matches!(Snapshot::from_json("[1, 2]"), Err(StateError::Codec(_))));
        assert!(matches!(Snapshot::from_json("not json"), Err(StateError::Codec(_))));
    }

    #[test]
    fn partial_config_keeps_only_present_fields() {
        let snapshot = Snapshot::from_json(r#"{ "__config": { "defaultKey": "de" } }"#).unwrap();
        let config = snapshot.config().unwrap();
        assert_eq!(config.default_key.as_deref(), Some("de"));
        assert_eq!(config.supported_keys, None);
    }

    #[test]
    fn embedded_json_escapes_html_sensitive_characters() {
        let mut snapshot = Snapshot::new();
        snapshot.insert(
            "bio",
            StoreState::new(json!("</script><b>&\u{2028}"), 1, 0),
        );

        let embedded = snapshot.to_embedded_json().unwrap();
        assert!(!embedded.contains('<'));
        assert!(!embedded.contains('>'));
        assert!(!embedded.contains('&'));
        assert!(!embedded.contains('\u{2028}'));

        let decoded = Snapshot::from_json(&embedded).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn msgpack_carries_the_same_state() {
        let snapshot = sample();
        let bytes = snapshot.to_msgpack().unwrap();
        assert_eq!(Snapshot::from_msgpack(&bytes).unwrap(), snapshot);
    }
}
