//! Observable side of the dependency graph.
//!
//! An observable is anything whose reads are trackable and whose writes are
//! broadcastable: containers ([`obx::Obx`]) and reactive slots
//! ([`property::ObxProperty`], which plays both roles). This module holds
//! the shared observer bookkeeping, the three propagation primitives of the
//! two-phase dirty algorithm, and the reference-counted batch control.
//!
//! # Propagation primitives
//!
//! - [`propagate_changed`] — a container mutated; the change is confirmed
//!   immediately (containers carry only a version number, nothing to
//!   compare), so observers go straight to `Stale`.
//! - [`propagate_maybe_changed`] — a slot was written or a computed's input
//!   moved; observers move to `PossiblyStale` and eager ones schedule.
//! - [`propagate_change_confirmed`] — a settle confirmed an actual value
//!   change; possibly-stale observers harden to `Stale`.
//!
//! Each primitive is guarded by the observable's lowest-observer-state so a
//! wave is not re-broadcast to an already-dirty observer set.

pub(crate) mod obx;
pub(crate) mod object;
pub(crate) mod array;
pub(crate) mod map;
pub(crate) mod set;
pub(crate) mod property;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::trace;

use crate::derivation::{Derivation, DerivationState};
use crate::error::Result;
use crate::global::{self, ObxId};
use crate::reaction;

/// The observable role in the dependency graph.
pub(crate) trait Observable: Send + Sync {
    fn id(&self) -> ObxId;
    fn name(&self) -> &str;

    /// Summary of the dirtiest state among observers; propagation guard.
    fn lowest_observer_state(&self) -> DerivationState;
    fn set_lowest_observer_state(&self, state: DerivationState);

    fn add_observer(&self, observer: &Arc<dyn Derivation>);
    fn remove_observer(&self, id: ObxId);
    fn observers(&self) -> Vec<Arc<dyn Derivation>>;
    fn has_observers(&self) -> bool;

    /// Resolve any staged or possibly-stale state so the observable's value
    /// is current. Containers have nothing to settle.
    fn settle(&self) -> Result<()> {
        Ok(())
    }

    /// Called when the last observer detaches.
    fn on_become_unobserved(&self) {}
}

/// Ordered observer set with weak back-references.
///
/// The observable never owns a derivation's lifetime: entries are weak and
/// dead ones are pruned on snapshot.
pub(crate) struct ObserverSet {
    entries: Mutex<Vec<(ObxId, Weak<dyn Derivation>)>>,
    lowest: AtomicU8,
}

impl ObserverSet {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            lowest: AtomicU8::new(DerivationState::UpToDate as u8),
        }
    }

    pub(crate) fn add(&self, observer: &Arc<dyn Derivation>) {
        let id = observer.id();
        let mut entries = self.entries.lock();
        if !entries.iter().any(|(eid, _)| *eid == id) {
            entries.push((id, Arc::downgrade(observer)));
            // A cleaner observer re-arms the propagation guard, otherwise a
            // summary left at Stale by departed observers would swallow the
            // next wave.
            let state = observer.dependencies_state();
            if state < self.lowest() {
                self.set_lowest(state);
            }
        }
    }

    pub(crate) fn remove(&self, id: ObxId) {
        self.entries.lock().retain(|(eid, _)| *eid != id);
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn Derivation>> {
        let mut entries = self.entries.lock();
        entries.retain(|(_, weak)| weak.strong_count() > 0);
        entries.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        let mut entries = self.entries.lock();
        entries.retain(|(_, weak)| weak.strong_count() > 0);
        entries.is_empty()
    }

    pub(crate) fn lowest(&self) -> DerivationState {
        DerivationState::from_u8(self.lowest.load(Ordering::SeqCst))
    }

    pub(crate) fn set_lowest(&self, state: DerivationState) {
        self.lowest.store(state as u8, Ordering::SeqCst);
    }
}

/// Register `obs` as a dependency of the derivation currently being tracked,
/// if any.
pub(crate) fn report_observed(obs: &Arc<dyn Observable>) {
    global::observe(obs);
}

/// A container mutation happened: confirmed change, observers go straight
/// to `Stale` and eager ones schedule. `force` bypasses the already-dirty
/// short-circuit.
pub(crate) fn propagate_changed(obs: &Arc<dyn Observable>, force: bool) {
    if !force && obs.lowest_observer_state() == DerivationState::Stale {
        return;
    }
    obs.set_lowest_observer_state(DerivationState::Stale);
    trace!(observable = %obs.name(), "propagate changed");
    for d in obs.observers() {
        let was_up_to_date = d.dependencies_state() == DerivationState::UpToDate;
        d.set_dependencies_state(DerivationState::Stale);
        if was_up_to_date {
            d.on_become_dirty();
        }
    }
}

/// A write was staged or an input moved: observers become `PossiblyStale`.
pub(crate) fn propagate_maybe_changed(obs: &Arc<dyn Observable>) {
    if obs.lowest_observer_state() != DerivationState::UpToDate {
        return;
    }
    obs.set_lowest_observer_state(DerivationState::PossiblyStale);
    trace!(observable = %obs.name(), "propagate maybe-changed");
    for d in obs.observers() {
        if d.dependencies_state() == DerivationState::UpToDate {
            d.set_dependencies_state(DerivationState::PossiblyStale);
            d.on_become_dirty();
        }
    }
}

/// A settle confirmed an actual value change: possibly-stale observers
/// harden to `Stale`. Observers already settled in this wave stay put.
pub(crate) fn propagate_change_confirmed(obs: &Arc<dyn Observable>) {
    if obs.lowest_observer_state() == DerivationState::Stale {
        return;
    }
    obs.set_lowest_observer_state(DerivationState::Stale);
    trace!(observable = %obs.name(), "propagate change-confirmed");
    for d in obs.observers() {
        match d.dependencies_state() {
            DerivationState::PossiblyStale => d.set_dependencies_state(DerivationState::Stale),
            DerivationState::UpToDate => obs.set_lowest_observer_state(DerivationState::UpToDate),
            _ => {}
        }
    }
}

/// Open a write transaction. While at least one batch is open, reaction
/// scheduling is deferred; dirty-state propagation still happens eagerly.
pub fn start_batch() {
    global::enter_batch();
}

/// Close a write transaction. The outermost close drains the reactions
/// parked during the batch: synchronous ones run immediately, the rest are
/// handed to the next-tick scheduler. N writes in one batch produce at most
/// one scheduled run per affected reaction.
pub fn end_batch() {
    if global::leave_batch() == 0 {
        reaction::run_pending_reactions();
    }
}

/// Run `f` inside a batch, closing it on every exit path.
pub fn transaction<T>(f: impl FnOnce() -> T) -> T {
    struct BatchGuard;
    impl Drop for BatchGuard {
        fn drop(&mut self) {
            end_batch();
        }
    }
    start_batch();
    let _guard = BatchGuard;
    f()
}
