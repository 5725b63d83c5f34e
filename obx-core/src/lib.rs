//! Obx Core
//!
//! This crate provides a fine-grained reactive dependency-tracking engine.
//! It implements:
//!
//! - Observable values, objects, arrays, maps and sets
//! - Lazy computed values and eager reactions over a shared dependency graph
//! - Two-phase dirty propagation (possibly-stale, then confirmed) so
//!   unchanged intermediate results short-circuit recomputation
//! - Reference-counted batching and a cooperative next-tick scheduler
//! - Slash-separated path access over nested value trees
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `global`: thread-local runtime state and the dependency-tracking stack
//! - `derivation`: the dirty-state machine shared by computeds and reactions
//! - `observable`: containers, per-key property cells and change propagation
//! - `reaction`: eager side-effecting observers and their scheduling
//! - `scheduler`: the logical tick that coalesces asynchronous reactions
//! - `path`: path-based reads and writes over a value tree
//!
//! # Example
//!
//! ```rust,ignore
//! use obx_core::{observable, autorun, computed, Value};
//!
//! // Wrap a value tree for deep observation
//! let state = observable(serde_json::json!({ "count": 1 }));
//! let obj = state.as_object().unwrap().clone();
//!
//! // Create a derived value
//! let doubled = computed(move || {
//!     Value::Int(obj.get("count").unwrap().as_int().unwrap_or(0) * 2)
//! });
//!
//! // Create a reaction
//! autorun(move || {
//!     println!("doubled = {:?}", doubled.get());
//! });
//!
//! // Update the state; the reaction re-runs on the next tick
//! state.as_object().unwrap().set("count", 5).unwrap();
//! obx_core::next_tick().await;
//! ```

mod derivation;
mod error;
mod global;
mod observable;
pub mod path;
mod reaction;
mod scheduler;
mod value;

pub use derivation::CaughtException;
pub use error::{ObxError, Result};
pub use global::{untracked, ObxId};
pub use observable::array::ObxArray;
pub use observable::map::ObxMap;
pub use observable::object::ObxObject;
pub use observable::obx::ObxFlag;
pub use observable::property::Computed;
pub use observable::set::ObxSet;
pub use observable::{end_batch, start_batch, transaction};
pub use path::{del_path, extend, get_path, has_path, set_path};
pub use reaction::{autorun, autorun_with, AutorunOptions, Disposer, Reaction};
pub use scheduler::{next_tick, next_tick_with, NextTick};
pub use value::{as_new_value, raw, Value};

/// Wrap a value tree for deep observation. Aggregates at every depth are
/// instrumented; primitives pass through unchanged.
pub fn observable(value: impl Into<Value>) -> Value {
    observable_with(value, ObxFlag::Deep)
}

/// Wrap a value with an explicit propagation depth.
pub fn observable_with(value: impl Into<Value>, flag: ObxFlag) -> Value {
    let value = value.into();
    value::ensure_reactive(&value, flag);
    value
}

/// Wrap with reference semantics: only whole-value replacement is a change.
pub fn observable_ref(value: impl Into<Value>) -> Value {
    observable_with(value, ObxFlag::Ref)
}

/// Wrap with value semantics: equality comparison only, no instrumentation
/// of the aggregate's interior.
pub fn observable_val(value: impl Into<Value>) -> Value {
    observable_with(value, ObxFlag::Val)
}

/// Wrap one level deep: membership changes are tracked, nested aggregates
/// stay plain.
pub fn observable_shallow(value: impl Into<Value>) -> Value {
    observable_with(value, ObxFlag::Shallow)
}

/// Create a lazy derived value from a zero-argument function.
pub fn computed(getter: impl Fn() -> Value + Send + Sync + 'static) -> Computed {
    Computed::new(getter)
}

/// [`computed`] with a debug name; surfaces in logs.
pub fn computed_named(name: &str, getter: impl Fn() -> Value + Send + Sync + 'static) -> Computed {
    Computed::named(name, getter)
}

/// Broadcast a confirmed structural change on a wrapped aggregate without
/// mutating it. `force` re-notifies observers that are already dirty. A
/// no-op on primitives and plain aggregates.
pub fn report_change(value: &Value, force: bool) {
    if let Some(obx) = value.obx() {
        obx.report_change(force);
    }
}

/// Tear down the engine's thread-local state: dispose registered reactions,
/// drop scheduled ticks and reset counters. For test isolation.
pub fn reset() {
    scheduler::clear_ticks();
    reaction::clear_reactions();
    global::reset_state();
}
