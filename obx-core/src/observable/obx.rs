//! Observable Container Core
//!
//! An [`Obx`] instruments one wrapped aggregate (object, array, map or set)
//! as a single reactive unit: a version counter plus an observer set.
//! Containers do not memoize a previous value to compare against — a
//! structural mutation bumps the version and broadcasts a confirmed change
//! immediately, with no possibly-stale phase.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::derivation::DerivationState;
use crate::global::{self, ObxId};
use crate::observable::{
    end_batch, propagate_changed, report_observed, start_batch, Observable, ObserverSet,
};

/// Propagation depth for a wrapped aggregate.
///
/// The ordering is meaningful: read instrumentation is active from
/// `Shallow` up, and `Deep` additionally wraps nested aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ObxFlag {
    /// Replacing the whole value triggers change; internal mutation of the
    /// old or new value is invisible.
    Ref = 0,
    /// Like `Ref`, intended for primitive/opaque values; equality only.
    Val = 1,
    /// Structural membership changes of the wrapped aggregate trigger
    /// change; nested elements stay plain unless independently wrapped.
    Shallow = 2,
    /// Nested aggregates are recursively wrapped, so mutations at any depth
    /// are tracked. The default.
    Deep = 3,
}

impl ObxFlag {
    /// The flag nested aggregates receive when inserted under this one.
    pub(crate) fn child_flag(self) -> Option<ObxFlag> {
        match self {
            ObxFlag::Deep => Some(ObxFlag::Deep),
            _ => None,
        }
    }

    /// Whether reads and in-place mutators are instrumented at all.
    pub(crate) fn tracks(self) -> bool {
        self >= ObxFlag::Shallow
    }
}

/// The reactive identity of one wrapped aggregate.
pub(crate) struct Obx {
    id: ObxId,
    name: String,
    flag: ObxFlag,
    local_ver: AtomicU64,
    observers: ObserverSet,
    weak_self: Weak<Obx>,
}

impl Obx {
    pub(crate) fn new(kind: &str, flag: ObxFlag) -> Arc<Self> {
        let id = global::next_id();
        Arc::new_cyclic(|weak| Self {
            id,
            name: format!("{kind}@{id}"),
            flag,
            local_ver: AtomicU64::new(0),
            observers: ObserverSet::new(),
            weak_self: weak.clone(),
        })
    }

    fn as_observable(&self) -> Arc<dyn Observable> {
        self.weak_self.upgrade().expect("container still referenced") as Arc<dyn Observable>
    }

    pub(crate) fn flag(&self) -> ObxFlag {
        self.flag
    }

    pub(crate) fn version(&self) -> u64 {
        self.local_ver.load(Ordering::SeqCst)
    }

    /// Bump the version without broadcasting. Used by `as_new_value`.
    pub(crate) fn bump_version(&self) {
        self.local_ver.fetch_add(1, Ordering::SeqCst);
    }

    /// Register the container as read by the current derivation, if its
    /// flag instruments reads.
    pub(crate) fn report_observed(&self) {
        if self.flag.tracks() {
            report_observed(&self.as_observable());
        }
    }

    /// Bump the version and broadcast a confirmed structural change to the
    /// observer set. `force` re-broadcasts even to an already-dirty set.
    pub(crate) fn report_change(&self, force: bool) {
        start_batch();
        self.local_ver.fetch_add(1, Ordering::SeqCst);
        debug!(container = %self.name, version = self.version(), "structural change");
        propagate_changed(&self.as_observable(), force);
        end_batch();
    }
}

impl Observable for Obx {
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

    fn add_observer(&self, observer: &Arc<dyn crate::derivation::Derivation>) {
        self.observers.add(observer);
    }

    fn remove_observer(&self, id: ObxId) {
        self.observers.remove(id);
    }

    fn observers(&self) -> Vec<Arc<dyn crate::derivation::Derivation>> {
        self.observers.snapshot()
    }

    fn has_observers(&self) -> bool {
        !self.observers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_ordering_gates_instrumentation() {
        assert!(!ObxFlag::Ref.tracks());
        assert!(!ObxFlag::Val.tracks());
        assert!(ObxFlag::Shallow.tracks());
        assert!(ObxFlag::Deep.tracks());
        assert_eq!(ObxFlag::Deep.child_flag(), Some(ObxFlag::Deep));
        assert_eq!(ObxFlag::Shallow.child_flag(), None);
    }

    #[test]
    fn report_change_bumps_version() {
        let obx = Obx::new("ObxArray", ObxFlag::Deep);
        assert_eq!(obx.version(), 0);
        obx.report_change(false);
        obx.report_change(false);
        assert_eq!(obx.version(), 2);
    }
}
