//! # Property-Based Tests
//!
//! Invariants of versions, snapshots and propagation checked over random
//! write sequences.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use eghact_reactive::history::HistoryRecorder;
use eghact_reactive::reactive::{Computed, Runtime, Signal};
use eghact_reactive::snapshot::{Snapshot, StoreState};
use eghact_reactive::store::{Registry, Store, StoreOptions};
use proptest::collection::{btree_map, vec};
use proptest::prelude::*;
use serde_json::{json, Value};

fn json_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[a-zA-Z0-9 <>&/]{0,12}".prop_map(Value::String),
    ]
}

fn json_value() -> impl Strategy<Value = Value> {
    json_leaf().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            vec(inner.clone(), 0..4).prop_map(Value::Array),
            btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn snapshot_strategy() -> impl Strategy<Value = Snapshot> {
    btree_map(
        "[a-z][a-z_]{0,9}",
        (json_value(), 0u64..1_000, 0u64..u64::from(u32::MAX)),
        0..6,
    )
    .prop_map(|entries: BTreeMap<String, (Value, u64, u64)>| {
        let mut snapshot = Snapshot::new();
        for (name, (value, version, timestamp)) in entries {
            snapshot.insert(name, StoreState::new(value, version, timestamp));
        }
        snapshot
    })
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

proptest! {
    /// A store's version never decreases and grows by exactly one per
    /// effective change.
    #[test]
    fn store_version_counts_effective_changes(writes in vec(0i32..4, 1..60)) {
        let registry = Registry::new();
        let store = Store::new(&registry, "n", 0, StoreOptions::new()).expect("store");

        let mut expected = 0u64;
        let mut current = 0;
        for value in writes {
            let before = store.version();
            store.set(value).expect("set");
            if value != current {
                expected += 1;
                current = value;
            }
            prop_assert!(store.version() >= before);
            prop_assert_eq!(store.version(), expected);
            prop_assert_eq!(store.get(), current);
        }
    }

    /// Writes grouped into a batch land on the same final value as the same
    /// writes applied one by one.
    #[test]
    fn batched_writes_match_sequential_writes(writes in vec(-50i32..50, 1..30)) {
        let sequential = Registry::new();
        let a = Store::new(&sequential, "n", 0, StoreOptions::new()).expect("store");
        for value in &writes {
            a.set(*value).expect("set");
        }

        let batched = Registry::new();
        let b = Store::new(&batched, "n", 0, StoreOptions::new()).expect("store");
        batched.batch(|| {
            for value in &writes {
                b.set(*value).expect("set");
            }
        });

        prop_assert_eq!(a.get(), b.get());
    }

    /// Queued updates inside a batch compose.
    #[test]
    fn batched_updates_compose(increments in vec(1i64..10, 1..20)) {
        let registry = Registry::new();
        let total = Store::new(&registry, "total", 0i64, StoreOptions::new()).expect("store");

        registry.batch(|| {
            for step in &increments {
                let step = *step;
                total.update(move |t| t + step).expect("update");
            }
        });

        prop_assert_eq!(total.get(), increments.iter().sum::<i64>());
    }

    /// Restoring a capture into the registry it came from changes nothing.
    #[test]
    fn restore_of_own_capture_is_identity(writes in vec((0usize..3, -5i32..5), 0..30)) {
        let registry = Registry::new();
        let stores: Vec<Store<i32>> = (0..3)
            .map(|i| Store::new(&registry, format!("s{i}"), 0, StoreOptions::new()).expect("store"))
            .collect();
        for (index, value) in writes {
            stores[index].set(value).expect("set");
        }

        let before = registry.capture();
        let report = registry.restore(&before);

        prop_assert!(report.unknown.is_empty());
        prop_assert!(report.invalid.is_empty());
        prop_assert_eq!(registry.capture(), before);
    }

    /// A fresh registry hydrated from a capture reads the same values.
    #[test]
    fn hydration_reproduces_values(values in vec(any::<i64>(), 1..8)) {
        let server = Registry::new();
        for (i, value) in values.iter().enumerate() {
            let store = Store::new(&server, format!("s{i}"), 0i64, StoreOptions::new()).expect("store");
            store.set(*value).expect("set");
        }
        let payload = server.capture().to_embedded_json().expect("encode");

        let client = Registry::new();
        let client_stores: Vec<Store<i64>> = (0..values.len())
            .map(|i| Store::new(&client, format!("s{i}"), 0i64, StoreOptions::new()).expect("store"))
            .collect();
        client.restore_json(&payload);

        for (store, value) in client_stores.iter().zip(&values) {
            prop_assert_eq!(store.get(), *value);
        }
    }

    /// Snapshots survive both wire formats unchanged.
    #[test]
    fn snapshot_codecs_preserve_content(snapshot in snapshot_strategy()) {
        let from_json = Snapshot::from_json(&snapshot.to_json().expect("json")).expect("parse");
        prop_assert_eq!(&from_json, &snapshot);

        let embedded = snapshot.to_embedded_json().expect("embedded");
        prop_assert!(!embedded.contains('<'));
        prop_assert_eq!(&Snapshot::from_json(&embedded).expect("parse"), &snapshot);

        let from_msgpack = Snapshot::from_msgpack(&snapshot.to_msgpack().expect("msgpack")).expect("parse");
        prop_assert_eq!(&from_msgpack, &snapshot);
    }

    /// History never holds more than its capacity, and keeps the newest
    /// entries in order.
    #[test]
    fn history_is_bounded(capacity in 1usize..8, writes in vec(1i32..1000, 0..40)) {
        let registry = Registry::new();
        let history = HistoryRecorder::attach(&registry, capacity);
        let store = Store::new(&registry, "n", 0, StoreOptions::new()).expect("store");

        let mut effective = Vec::new();
        let mut current = 0;
        for value in writes {
            store.set(value).expect("set");
            if value != current {
                effective.push(value);
                current = value;
            }
        }

        let entries = history.entries();
        prop_assert!(entries.len() <= capacity);
        let kept: Vec<Value> = effective
            .iter()
            .rev()
            .take(capacity)
            .rev()
            .map(|v| json!(v))
            .collect();
        let recorded: Vec<Value> = entries.into_iter().map(|e| e.next).collect();
        prop_assert_eq!(recorded, kept);
    }

    /// A computed over N signals evaluates at most once per read, however
    /// many of its inputs changed.
    #[test]
    fn computed_evaluates_once_per_read(
        initial in vec(0i32..100, 2..6),
        changes in vec((0usize..6, 0i32..100), 1..10),
    ) {
        let rt = Runtime::new();
        let signals: Vec<Signal<i32>> = initial.iter().map(|v| Signal::new(&rt, *v)).collect();
        let evaluations = Arc::new(AtomicUsize::new(0));
        let sum = Computed::new(&rt, {
            let (signals, evaluations) = (signals.clone(), evaluations.clone());
            move || {
                evaluations.fetch_add(1, Ordering::SeqCst);
                signals.iter().map(Signal::get).sum::<i32>()
            }
        });
        prop_assert_eq!(sum.get().expect("sum"), initial.iter().sum::<i32>());

        for (index, value) in changes {
            signals[index % signals.len()].set(value);
        }
        let before = evaluations.load(Ordering::SeqCst);
        let expected: i32 = signals.iter().map(Signal::get_untracked).sum();

        prop_assert_eq!(sum.get().expect("sum"), expected);
        prop_assert!(evaluations.load(Ordering::SeqCst) <= before + 1);
    }
}
