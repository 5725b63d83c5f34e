//! Observable Property
//!
//! An [`ObxProperty`] is a single reactive slot: either a plain value field
//! or a memoized computed expression. It plays both graph roles at once —
//! observable (it has observers) and derivation (a computed one reads other
//! observables). The mode is fixed at creation: a property is plain exactly
//! when it has no getter.
//!
//! # Write staging
//!
//! Plain slots do not apply writes immediately. A write stages the candidate
//! in `pending` and waves "maybe changed" at observers; the staged value is
//! committed when the slot settles (on the next read, or when an observer
//! resolves its possibly-stale state). If the staged value turns out equal
//! to the committed one, the wave dies here and downstream derivations
//! never recompute.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::trace;

use crate::derivation::{
    clear_observing, set_derivation_dirty, should_compute, track, CaughtException, Derivation,
    DerivationState,
};
use crate::error::{ObxError, Result};
use crate::global::{self, ObxId};
use crate::observable::obx::ObxFlag;
use crate::observable::{
    end_batch, propagate_change_confirmed, propagate_maybe_changed, report_observed, start_batch,
    Observable, ObserverSet,
};
use crate::value::{wrap_for_flag, Value};

pub(crate) type Getter = Box<dyn Fn() -> Value + Send + Sync>;
pub(crate) type Setter = Box<dyn Fn(Value) + Send + Sync>;

#[derive(Clone)]
enum Stored {
    Val(Value),
    Caught(CaughtException),
}

struct PropInner {
    value: Stored,
    pending: Option<Value>,
    /// Version of the committed value's container at last settle.
    object_ver: u64,
}

pub(crate) struct ObxProperty {
    id: ObxId,
    name: String,
    flag: ObxFlag,
    getter: Option<Getter>,
    setter: Option<Setter>,
    inner: Mutex<PropInner>,
    deps_state: AtomicU8,
    observing: Mutex<SmallVec<[Arc<dyn Observable>; 4]>>,
    observers: ObserverSet,
    is_computing: AtomicBool,
    running_setter: AtomicBool,
    weak_self: Weak<ObxProperty>,
}

impl ObxProperty {
    pub(crate) fn new_plain(name: &str, value: Value, flag: ObxFlag) -> Arc<Self> {
        Self::build(name, None, None, wrap_for_flag(value, flag), flag)
    }

    pub(crate) fn new_computed(
        name: &str,
        getter: Getter,
        setter: Option<Setter>,
        flag: ObxFlag,
    ) -> Arc<Self> {
        Self::build(name, Some(getter), setter, Value::Null, flag)
    }

    fn build(
        name: &str,
        getter: Option<Getter>,
        setter: Option<Setter>,
        value: Value,
        flag: ObxFlag,
    ) -> Arc<Self> {
        let id = global::next_id();
        Arc::new_cyclic(|weak| Self {
            id,
            name: format!("{name}@{id}"),
            flag,
            getter,
            setter,
            inner: Mutex::new(PropInner {
                object_ver: value.version(),
                value: Stored::Val(value),
                pending: None,
            }),
            deps_state: AtomicU8::new(DerivationState::NotTracking as u8),
            observing: Mutex::new(SmallVec::new()),
            observers: ObserverSet::new(),
            is_computing: AtomicBool::new(false),
            running_setter: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    pub(crate) fn prop_name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_computed(&self) -> bool {
        self.getter.is_some()
    }

    fn as_observable(&self) -> Arc<dyn Observable> {
        self.weak_self.upgrade().expect("property still referenced") as Arc<dyn Observable>
    }

    fn as_derivation(&self) -> Arc<dyn Derivation> {
        self.weak_self.upgrade().expect("property still referenced") as Arc<dyn Derivation>
    }

    /// Identity-plus-version equality against the committed version marker.
    fn same(object_ver: u64, old: &Value, new: &Value) -> bool {
        Value::is(old, new) && (new.is_primitive() || new.version() == object_ver)
    }

    /// Read the current value, registering it as a dependency of the
    /// tracked derivation and settling staged/stale state first.
    ///
    /// A failure contained during an earlier recompute is re-raised here,
    /// at the point of use.
    pub(crate) fn get(&self) -> Result<Value> {
        if self.is_computing.load(Ordering::SeqCst) {
            return Err(ObxError::ComputationCycle(self.name.clone()));
        }
        report_observed(&self.as_observable());
        self.if_modified()?;
        let stored = self.inner.lock().value.clone();
        match stored {
            Stored::Val(v) => Ok(v),
            Stored::Caught(c) => c.rethrow(),
        }
    }

    /// Read the committed value with no tracking and no settling.
    pub(crate) fn peek(&self) -> Value {
        match &self.inner.lock().value {
            Stored::Val(v) => v.clone(),
            Stored::Caught(_) => Value::Null,
        }
    }

    /// Write the slot.
    ///
    /// Plain slots stage the candidate (no-op if it equals the visible
    /// value); computed slots require a setter, which runs untracked and
    /// then marks this property's own dependents possibly stale.
    pub(crate) fn set(&self, value: Value) -> Result<()> {
        if self.running_setter.load(Ordering::SeqCst) {
            return Err(ObxError::SetterCycle(self.name.clone()));
        }
        if self.getter.is_some() && self.setter.is_none() {
            return Err(ObxError::ReadonlyAssignment(self.name.clone()));
        }

        let value = wrap_for_flag(value, self.flag);

        if let Some(setter) = &self.setter {
            struct SetterReset<'a>(&'a AtomicBool);
            impl Drop for SetterReset<'_> {
                fn drop(&mut self) {
                    self.0.store(false, Ordering::SeqCst);
                }
            }
            self.running_setter.store(true, Ordering::SeqCst);
            let _reset = SetterReset(&self.running_setter);
            global::untracked(|| setter(value));
            set_derivation_dirty(&self.as_derivation());
            return Ok(());
        }

        let first_stage = {
            let mut inner = self.inner.lock();
            let visible_same = match (&inner.pending, &inner.value) {
                (Some(pending), _) => Self::same(inner.object_ver, pending, &value),
                (None, Stored::Val(old)) => Self::same(inner.object_ver, old, &value),
                (None, Stored::Caught(_)) => false,
            };
            if visible_same {
                return Ok(());
            }
            let first = inner.pending.is_none();
            inner.pending = Some(value);
            first
        };
        if first_stage {
            trace!(property = %self.name, "write staged");
            propagate_maybe_changed(&self.as_observable());
        }
        Ok(())
    }

    /// Settle this slot: recompute a stale computed, or commit a staged
    /// plain write, confirming the change downstream if the value really
    /// moved.
    pub(crate) fn if_modified(&self) -> Result<()> {
        if self.getter.is_some() {
            let d = self.as_derivation();
            if should_compute(&d)? {
                start_batch();
                let computed = self.compute_value();
                let result = match computed {
                    Ok(true) => {
                        {
                            let mut inner = self.inner.lock();
                            inner.object_ver = match &inner.value {
                                Stored::Val(v) => v.version(),
                                Stored::Caught(_) => 0,
                            };
                        }
                        propagate_change_confirmed(&self.as_observable());
                        Ok(())
                    }
                    Ok(false) => Ok(()),
                    Err(e) => Err(e),
                };
                end_batch();
                return result;
            }
            return Ok(());
        }

        let confirmed = {
            let mut inner = self.inner.lock();
            match inner.pending.take() {
                None => false,
                Some(next) => {
                    let changed = match &inner.value {
                        Stored::Val(old) => !Self::same(inner.object_ver, old, &next),
                        Stored::Caught(_) => true,
                    };
                    inner.object_ver = next.version();
                    inner.value = Stored::Val(next);
                    changed
                }
            }
        };
        if confirmed {
            propagate_change_confirmed(&self.as_observable());
        }
        Ok(())
    }

    /// Run the getter as a tracked derivation. Returns whether the result
    /// differs from the previous one (a contained failure on either side
    /// always counts as different).
    fn compute_value(&self) -> Result<bool> {
        if self.is_computing.swap(true, Ordering::SeqCst) {
            return Err(ObxError::ComputationCycle(self.name.clone()));
        }
        struct ComputingReset<'a>(&'a AtomicBool);
        impl Drop for ComputingReset<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::SeqCst);
            }
        }
        let _reset = ComputingReset(&self.is_computing);
        let _depth = global::enter_computation(&self.name)?;

        let getter = self.getter.as_ref().expect("computed property has a getter");
        let old = self.inner.lock().value.clone();
        let d = self.as_derivation();
        let result = track(&d, || getter());

        let mut inner = self.inner.lock();
        let changed = match (&old, &result) {
            (Stored::Caught(_), _) | (_, Err(_)) => true,
            (Stored::Val(old_value), Ok(new_value)) => {
                !Self::same(inner.object_ver, old_value, new_value)
            }
        };
        inner.value = match result {
            Ok(v) => Stored::Val(wrap_for_flag(v, self.flag)),
            Err(caught) => Stored::Caught(caught),
        };
        trace!(property = %self.name, changed, "recomputed");
        Ok(changed)
    }
}

impl Observable for ObxProperty {
    fn id(&self) -> ObxId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn lowest_observer_state(&self) -> DerivationState {
        self.observers.lowest()
    }

    fn set_lowest_observer_state(&self, state: DerivationState) {
        self.observers.set_lowest(state);
    }

    fn add_observer(&self, observer: &Arc<dyn Derivation>) {
        self.observers.add(observer);
    }

    fn remove_observer(&self, id: ObxId) {
        self.observers.remove(id);
    }

    fn observers(&self) -> Vec<Arc<dyn Derivation>> {
        self.observers.snapshot()
    }

    fn has_observers(&self) -> bool {
        !self.observers.is_empty()
    }

    fn settle(&self) -> Result<()> {
        self.if_modified()
    }

    fn on_become_unobserved(&self) {
        // A computed with no observers suspends: drop its dependency edges
        // and recompute from scratch on the next read.
        if self.getter.is_some() {
            clear_observing(&self.as_derivation());
        }
    }
}

impl Derivation for ObxProperty {
    fn id(&self) -> ObxId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies_state(&self) -> DerivationState {
        DerivationState::from_u8(self.deps_state.load(Ordering::SeqCst))
    }

    fn set_dependencies_state(&self, state: DerivationState) {
        self.deps_state.store(state as u8, Ordering::SeqCst);
    }

    fn observing(&self) -> Vec<Arc<dyn Observable>> {
        self.observing.lock().iter().cloned().collect()
    }

    fn replace_observing(&self, list: Vec<Arc<dyn Observable>>) {
        *self.observing.lock() = SmallVec::from_vec(list);
    }

    fn on_become_dirty(&self) {
        propagate_maybe_changed(&self.as_observable());
    }
}

/// A lazy derived value created from a zero-argument function.
///
/// Recomputed only on demand when potentially stale; reading it inside a
/// tracked run registers it as a dependency like any other observable.
#[derive(Clone)]
pub struct Computed {
    prop: Arc<ObxProperty>,
}

impl Computed {
    pub fn new(getter: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        Self::named("Computed", getter)
    }

    pub fn named(name: &str, getter: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        Self {
            prop: ObxProperty::new_computed(name, Box::new(getter), None, ObxFlag::Deep),
        }
    }

    /// A writable computed: assignment invokes `setter` untracked.
    pub fn with_setter(
        name: &str,
        getter: impl Fn() -> Value + Send + Sync + 'static,
        setter: impl Fn(Value) + Send + Sync + 'static,
    ) -> Self {
        Self {
            prop: ObxProperty::new_computed(name, Box::new(getter), Some(Box::new(setter)), ObxFlag::Deep),
        }
    }

    /// Current value, recomputing if any dependency actually changed.
    ///
    /// Re-raises a failure contained during recomputation; returns an error
    /// for cyclic computation.
    pub fn get(&self) -> Result<Value> {
        self.prop.get()
    }

    pub fn set(&self, value: impl Into<Value>) -> Result<()> {
        self.prop.set(value.into())
    }

    pub fn name(&self) -> &str {
        self.prop.prop_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn plain_property_stages_and_commits() {
        let prop = ObxProperty::new_plain("x", Value::Int(1), ObxFlag::Deep);
        assert_eq!(prop.get().unwrap(), Value::Int(1));

        prop.set(Value::Int(2)).unwrap();
        // Committed on next read.
        assert_eq!(prop.get().unwrap(), Value::Int(2));
    }

    #[test]
    fn plain_property_write_of_equal_value_is_noop() {
        let prop = ObxProperty::new_plain("x", Value::Int(1), ObxFlag::Deep);
        prop.get().unwrap();
        prop.set(Value::Int(1)).unwrap();
        assert!(prop.inner.lock().pending.is_none());
    }

    #[test]
    fn computed_caches_until_marked() {
        let count = Arc::new(AtomicI32::new(0));
        let count_clone = count.clone();
        let comp = Computed::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
            Value::Int(42)
        });

        assert_eq!(comp.get().unwrap(), Value::Int(42));
        assert_eq!(comp.get().unwrap(), Value::Int(42));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn readonly_computed_rejects_assignment() {
        let comp = Computed::new(|| Value::Int(1));
        match comp.set(2) {
            Err(ObxError::ReadonlyAssignment(_)) => {}
            other => panic!("expected ReadonlyAssignment, got {other:?}"),
        }
    }

    #[test]
    fn computed_with_setter_accepts_assignment() {
        let target = ObxProperty::new_plain("t", Value::Int(0), ObxFlag::Deep);
        let target_read = target.clone();
        let target_write = target.clone();
        let comp = Computed::with_setter(
            "c",
            move || target_read.get().unwrap(),
            move |v| {
                target_write.set(v).unwrap();
            },
        );
        comp.set(7).unwrap();
        assert_eq!(comp.get().unwrap(), Value::Int(7));
    }

    #[test]
    fn cyclic_computed_fails_fast() {
        let cell: Arc<Mutex<Option<Computed>>> = Arc::new(Mutex::new(None));
        let cell_clone = cell.clone();
        let comp = Computed::new(move || {
            let inner = cell_clone.lock().clone();
            match inner.expect("initialized").get() {
                Ok(v) => v,
                Err(e) => panic!("{e}"),
            }
        });
        *cell.lock() = Some(comp.clone());
        // The self-read is observed as a contained failure carrying the
        // cycle message.
        let err = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| comp.get())).unwrap_err();
        let msg = err
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default();
        assert!(msg.contains("cycle detected"), "message: {msg}");
    }

    #[test]
    fn failing_computed_contains_and_rethrows() {
        let comp = Computed::new(|| panic!("bad input"));
        let err = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| comp.get())).unwrap_err();
        assert_eq!(err.downcast_ref::<&str>(), Some(&"bad input"));
    }
}
