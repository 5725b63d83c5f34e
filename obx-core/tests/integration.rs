//! Integration tests for the reactive engine.
//!
//! These tests verify that observables, computed values, reactions, batching
//! and the tick scheduler work together correctly.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use obx_core::{
    autorun, autorun_with, computed, del_path, get_path, has_path, next_tick, next_tick_with,
    observable, observable_ref, raw, report_change, set_path, transaction, untracked,
    AutorunOptions, Value,
};

fn sync_options() -> AutorunOptions {
    AutorunOptions {
        sync: true,
        ..AutorunOptions::default()
    }
}

fn int(value: &Value) -> i64 {
    value.as_int().unwrap_or(0)
}

/// A computed depends on exactly the observables its last run read, so a
/// branch not taken is not a dependency.
#[test]
fn computed_tracks_only_read_dependencies() {
    let state = observable(json!({ "use_a": true, "a": 1, "b": 10 }));
    let obj = state.as_object().unwrap().clone();

    let computes = Arc::new(AtomicI32::new(0));
    let computes_clone = computes.clone();
    let obj_clone = obj.clone();
    let pick = computed(move || {
        computes_clone.fetch_add(1, Ordering::SeqCst);
        if obj_clone.get("use_a").unwrap() == Value::Bool(true) {
            obj_clone.get("a").unwrap()
        } else {
            obj_clone.get("b").unwrap()
        }
    });

    assert_eq!(pick.get().unwrap(), Value::Int(1));
    assert_eq!(computes.load(Ordering::SeqCst), 1);

    // The untaken branch is not a dependency.
    obj.set("b", 20).unwrap();
    assert_eq!(pick.get().unwrap(), Value::Int(1));
    assert_eq!(computes.load(Ordering::SeqCst), 1);

    obj.set("a", 2).unwrap();
    assert_eq!(pick.get().unwrap(), Value::Int(2));
    assert_eq!(computes.load(Ordering::SeqCst), 2);

    // Flipping the switch rebinds the dependency set.
    obj.set("use_a", false).unwrap();
    assert_eq!(pick.get().unwrap(), Value::Int(20));
    assert_eq!(computes.load(Ordering::SeqCst), 3);
    obj.set("a", 99).unwrap();
    assert_eq!(pick.get().unwrap(), Value::Int(20));
    assert_eq!(computes.load(Ordering::SeqCst), 3);
}

/// A change that leaves an intermediate computed's value identical stops
/// the wave there: downstream reactions never re-run.
#[test]
fn unchanged_intermediate_value_short_circuits() {
    let state = observable(json!({ "n": 1 }));
    let obj = state.as_object().unwrap().clone();

    let computes = Arc::new(AtomicI32::new(0));
    let computes_clone = computes.clone();
    let obj_clone = obj.clone();
    let parity = computed(move || {
        computes_clone.fetch_add(1, Ordering::SeqCst);
        Value::Int(int(&obj_clone.get("n").unwrap()) % 2)
    });

    let runs = Arc::new(AtomicI32::new(0));
    let runs_clone = runs.clone();
    let parity_clone = parity.clone();
    let disposer = autorun_with(
        move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            parity_clone.get().unwrap();
        },
        sync_options(),
    );
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(computes.load(Ordering::SeqCst), 1);

    // 1 -> 3: parity recomputes but stays 1, so the reaction is spared.
    obj.set("n", 3).unwrap();
    assert_eq!(computes.load(Ordering::SeqCst), 2);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // 3 -> 4: parity flips, the reaction runs.
    obj.set("n", 4).unwrap();
    assert_eq!(computes.load(Ordering::SeqCst), 3);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    disposer.dispose();
}

/// N writes inside one transaction produce one re-run.
#[test]
fn batched_writes_coalesce_into_one_run() {
    let state = observable(json!({ "x": 0, "y": 0 }));
    let obj = state.as_object().unwrap().clone();

    let runs = Arc::new(AtomicI32::new(0));
    let runs_clone = runs.clone();
    let obj_clone = obj.clone();
    let disposer = autorun_with(
        move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            obj_clone.get("x").unwrap();
            obj_clone.get("y").unwrap();
        },
        sync_options(),
    );

    transaction(|| {
        for i in 1..=5 {
            obj.set("x", i).unwrap();
            obj.set("y", -i).unwrap();
        }
    });
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(int(&obj.get("x").unwrap()), 5);

    disposer.dispose();
}

/// A panic inside a computed is contained as a sentinel and re-raised only
/// when the failing value is read; the engine itself keeps working.
#[test]
fn computed_failure_is_contained_until_read() {
    let state = observable(json!({ "n": 1 }));
    let obj = state.as_object().unwrap().clone();

    let obj_clone = obj.clone();
    let checked = computed(move || {
        let n = int(&obj_clone.get("n").unwrap());
        if n < 0 {
            panic!("negative input");
        }
        Value::Int(n * 10)
    });

    assert_eq!(checked.get().unwrap(), Value::Int(10));

    // The failing recompute happens here, contained.
    obj.set("n", -1).unwrap();
    let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| checked.get()));
    let payload = caught.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"negative input"));

    // Recovery: a later valid input computes normally.
    obj.set("n", 4).unwrap();
    assert_eq!(checked.get().unwrap(), Value::Int(40));
}

/// Path writes auto-create intermediate objects, and a reaction observing a
/// path re-runs when any hop changes.
#[test]
fn path_access_is_reactive() {
    let state = observable(json!({}));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let state_clone = state.clone();
    let disposer = autorun_with(
        move || {
            let v = get_path(&state_clone, "user/profile/name").unwrap();
            seen_clone.lock().unwrap().push(v);
        },
        sync_options(),
    );

    set_path(&state, "user/profile/name", "ada").unwrap();
    assert_eq!(
        raw(&state),
        json!({ "user": { "profile": { "name": "ada" } } })
    );
    assert!(has_path(&state, "user/profile/name").unwrap());

    assert!(del_path(&state, "user/profile/name").unwrap());
    assert!(!has_path(&state, "user/profile/name").unwrap());

    let seen = seen.lock().unwrap();
    assert_eq!(seen.first(), Some(&Value::Null));
    assert!(seen.contains(&Value::from("ada")));
    assert_eq!(seen.last(), Some(&Value::Null));

    disposer.dispose();
}

/// End-to-end: deep observable, computed, asynchronous reaction, one tick.
#[tokio::test]
async fn deep_state_computed_and_async_reaction() {
    let state = observable(json!({ "a": 1 }));
    let obj = state.as_object().unwrap().clone();

    let obj_clone = obj.clone();
    let double = computed(move || Value::Int(int(&obj_clone.get("a").unwrap()) * 2));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let double_clone = double.clone();
    let disposer = autorun(move || {
        seen_clone
            .lock()
            .unwrap()
            .push(int(&double_clone.get().unwrap()));
    });
    assert_eq!(*seen.lock().unwrap(), vec![2]);

    obj.set("a", 5).unwrap();
    // Not yet: asynchronous reactions wait for the tick.
    assert_eq!(*seen.lock().unwrap(), vec![2]);

    next_tick().await;
    assert_eq!(*seen.lock().unwrap(), vec![2, 10]);

    disposer.dispose();
    obx_core::reset();
}

/// Several writes before the tick still produce exactly one re-run.
#[tokio::test]
async fn async_reaction_coalesces_across_writes() {
    let state = observable(json!({ "n": 0 }));
    let obj = state.as_object().unwrap().clone();

    let runs = Arc::new(AtomicI32::new(0));
    let runs_clone = runs.clone();
    let obj_clone = obj.clone();
    let disposer = autorun(move || {
        runs_clone.fetch_add(1, Ordering::SeqCst);
        obj_clone.get("n").unwrap();
    });

    obj.set("n", 1).unwrap();
    obj.set("n", 2).unwrap();
    obj.set("n", 3).unwrap();
    next_tick().await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(int(&obj.get("n").unwrap()), 3);

    disposer.dispose();
    obx_core::reset();
}

/// A throttled reaction holds off while its window is open and fires once
/// after it elapses, folding the writes that arrived meanwhile.
#[tokio::test]
async fn throttled_reaction_waits_out_the_window() {
    let state = observable(json!({ "n": 0 }));
    let obj = state.as_object().unwrap().clone();

    let runs = Arc::new(AtomicI32::new(0));
    let runs_clone = runs.clone();
    let obj_clone = obj.clone();
    let disposer = autorun_with(
        move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            obj_clone.get("n").unwrap();
        },
        AutorunOptions {
            throttle: Some(Duration::from_millis(50)),
            ..AutorunOptions::default()
        },
    );
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    obj.set("n", 1).unwrap();
    next_tick().await;
    // Inside the window the reaction stays parked.
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    obj.set("n", 2).unwrap();
    std::thread::sleep(Duration::from_millis(60));
    next_tick().await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(int(&obj.get("n").unwrap()), 2);

    disposer.dispose();
    obx_core::reset();
}

/// Within one flush, reactions run in level order and tick callbacks run
/// after all reactions.
#[tokio::test]
async fn flush_orders_by_level_then_callbacks() {
    let state = observable(json!({ "n": 0 }));
    let obj = state.as_object().unwrap().clone();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (o1, o2, o3) = (order.clone(), order.clone(), order.clone());
    let (obj1, obj2) = (obj.clone(), obj.clone());
    let late = autorun_with(
        move || {
            obj1.get("n").unwrap();
            o1.lock().unwrap().push("late");
        },
        AutorunOptions {
            level: 1,
            ..AutorunOptions::default()
        },
    );
    let early = autorun_with(
        move || {
            obj2.get("n").unwrap();
            o2.lock().unwrap().push("early");
        },
        AutorunOptions {
            level: 0,
            ..AutorunOptions::default()
        },
    );
    order.lock().unwrap().clear();

    obj.set("n", 1).unwrap();
    next_tick_with(move || o3.lock().unwrap().push("callback"));
    next_tick().await;
    assert_eq!(*order.lock().unwrap(), vec!["early", "late", "callback"]);

    late.dispose();
    early.dispose();
    obx_core::reset();
}

/// `report_change` re-broadcasts a container change without mutating it,
/// and `force` reaches even already-notified observers.
#[test]
fn manual_report_change_retriggers_observers() {
    let state = observable(json!([1, 2, 3]));
    let arr = state.as_array().unwrap().clone();

    let runs = Arc::new(AtomicI32::new(0));
    let runs_clone = runs.clone();
    let arr_clone = arr.clone();
    let disposer = autorun_with(
        move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            arr_clone.to_vec();
        },
        sync_options(),
    );
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    report_change(&state, false);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    disposer.dispose();
}

/// Reads under `untracked` register no dependencies.
#[test]
fn untracked_reads_are_invisible() {
    let state = observable(json!({ "tracked": 0, "ignored": 0 }));
    let obj = state.as_object().unwrap().clone();

    let runs = Arc::new(AtomicI32::new(0));
    let runs_clone = runs.clone();
    let obj_clone = obj.clone();
    let disposer = autorun_with(
        move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            obj_clone.get("tracked").unwrap();
            untracked(|| obj_clone.get("ignored").unwrap());
        },
        sync_options(),
    );

    obj.set("ignored", 1).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    obj.set("tracked", 1).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    disposer.dispose();
}

/// Ref-wrapped aggregates register no reads, so interior mutation is
/// invisible to reactions.
#[test]
fn ref_wrapped_aggregate_is_opaque() {
    let state = observable_ref(json!([1]));
    let arr = state.as_array().unwrap().clone();

    let runs = Arc::new(AtomicI32::new(0));
    let runs_clone = runs.clone();
    let arr_clone = arr.clone();
    let disposer = autorun_with(
        move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            arr_clone.to_vec();
        },
        sync_options(),
    );

    arr.push(2);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(arr.to_vec().len(), 2);

    disposer.dispose();
}

/// A mutation of a nested aggregate under a deep root reaches observers of
/// that aggregate.
#[test]
fn deep_wrapping_tracks_nested_mutation() {
    let state = observable(json!({ "items": [] }));
    let obj = state.as_object().unwrap().clone();

    let runs = Arc::new(AtomicI32::new(0));
    let runs_clone = runs.clone();
    let obj_clone = obj.clone();
    let disposer = autorun_with(
        move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            if let Some(items) = obj_clone.get("items").unwrap().as_array() {
                items.len();
            }
        },
        sync_options(),
    );

    let items = obj.get("items").unwrap();
    items.as_array().unwrap().push(1);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    disposer.dispose();
}
