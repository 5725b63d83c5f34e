//! Derivation Protocol
//!
//! The shared state machine and propagation algorithm used by both computed
//! properties (lazy) and reactions (eager).
//!
//! # State machine
//!
//! `NotTracking -> UpToDate -> PossiblyStale -> Stale -> UpToDate`
//!
//! A dependency signalling "maybe changed" moves a derivation to
//! `PossiblyStale`; only a confirmed value change moves it to `Stale`.
//! Before recomputing, [`should_compute`] settles each dependency and checks
//! whether any actually changed — if none did, the derivation drops back to
//! `UpToDate` without recomputing. This two-phase design lets intermediate
//! computed layers absorb "maybe changed" noise without forcing a full
//! recompute cascade.
//!
//! # Exception containment
//!
//! A panic inside a tracked run never aborts the surrounding program. It is
//! captured as a [`CaughtException`] sentinel that compares unequal to every
//! value, propagates as "the value changed", and is re-raised only when the
//! failing value is actually read.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::Result;
use crate::global::{self, ObxId};
use crate::observable::Observable;

/// Derivation-side dirty state. Also used for an observable's
/// lowest-observer-state summary flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DerivationState {
    /// Never ran, or suspended; `observing` is empty.
    NotTracking = 0,
    /// Cached value/side effect reflects all current dependencies.
    UpToDate = 1,
    /// Some dependency signalled a possible change; not yet confirmed.
    PossiblyStale = 2,
    /// At least one dependency's value actually changed; recompute required.
    Stale = 3,
}

impl DerivationState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NotTracking,
            1 => Self::UpToDate,
            2 => Self::PossiblyStale,
            _ => Self::Stale,
        }
    }
}

/// Anything that can depend on observables: a computed property or a
/// reaction.
pub(crate) trait Derivation: Send + Sync {
    fn id(&self) -> ObxId;
    fn name(&self) -> &str;

    fn dependencies_state(&self) -> DerivationState;
    fn set_dependencies_state(&self, state: DerivationState);

    /// The observables read during the last tracked run, in read order.
    fn observing(&self) -> Vec<Arc<dyn Observable>>;
    fn replace_observing(&self, list: Vec<Arc<dyn Observable>>);

    /// A dependency signalled a possible change. Lazy derivations forward
    /// the maybe-changed wave to their own observers; eager ones schedule.
    fn on_become_dirty(&self);
}

/// A contained panic from a tracked run.
///
/// Holds the original panic payload so the first read can re-raise it with
/// `resume_unwind`; later reads re-panic with the extracted message.
#[derive(Clone)]
pub struct CaughtException {
    inner: Arc<CaughtInner>,
}

struct CaughtInner {
    message: String,
    payload: Mutex<Option<Box<dyn Any + Send>>>,
}

impl CaughtException {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "computation panicked".to_string()
        };
        Self {
            inner: Arc::new(CaughtInner {
                message,
                payload: Mutex::new(Some(payload)),
            }),
        }
    }

    pub(crate) fn from_message(message: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(CaughtInner {
                message: message.into(),
                payload: Mutex::new(None),
            }),
        }
    }

    pub fn message(&self) -> &str {
        &self.inner.message
    }

    /// Re-raise the contained failure at the point of use.
    pub fn rethrow(&self) -> ! {
        match self.inner.payload.lock().take() {
            Some(payload) => panic::resume_unwind(payload),
            None => panic!("{}", self.inner.message),
        }
    }
}

impl fmt::Debug for CaughtException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaughtException")
            .field("message", &self.inner.message)
            .finish()
    }
}

/// Run `f` as the tracked body of `derivation`.
///
/// Pushes a tracking frame, executes `f` under `catch_unwind`, pops the
/// frame on every exit path, and rebinds the derivation's dependency edges
/// to exactly the observables read during this run.
pub(crate) fn track<R>(
    derivation: &Arc<dyn Derivation>,
    f: impl FnOnce() -> R,
) -> std::result::Result<R, CaughtException> {
    change_dependencies_state_to_up_to_date(derivation);
    let guard = global::push_frame(derivation.id());
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    let observed = guard.finish();
    bind_dependencies(derivation, observed);
    result.map_err(CaughtException::from_payload)
}

/// Decide whether a derivation's cached result is out of date.
///
/// For `PossiblyStale`, settles each dependency in turn (committing staged
/// writes and recomputing nested computeds); if any confirms an actual
/// change the derivation lands in `Stale` and the answer is `true`. If none
/// did, the derivation and its dependencies drop back to `UpToDate` and the
/// propagation short-circuits here.
pub(crate) fn should_compute(derivation: &Arc<dyn Derivation>) -> Result<bool> {
    match derivation.dependencies_state() {
        DerivationState::UpToDate => Ok(false),
        DerivationState::NotTracking | DerivationState::Stale => Ok(true),
        DerivationState::PossiblyStale => {
            let _untracked = global::untracked_guard();
            for obs in derivation.observing() {
                obs.settle()?;
                if derivation.dependencies_state() == DerivationState::Stale {
                    trace!(derivation = %derivation.name(), dependency = %obs.name(), "dependency change confirmed");
                    return Ok(true);
                }
            }
            change_dependencies_state_to_up_to_date(derivation);
            Ok(false)
        }
    }
}

/// Settle a derivation and its dependencies at `UpToDate`.
pub(crate) fn change_dependencies_state_to_up_to_date(derivation: &Arc<dyn Derivation>) {
    if derivation.dependencies_state() == DerivationState::UpToDate {
        return;
    }
    for obs in derivation.observing() {
        obs.set_lowest_observer_state(DerivationState::UpToDate);
    }
    derivation.set_dependencies_state(DerivationState::UpToDate);
}

/// Diff the previous dependency list against the reads of the latest run,
/// updating observer back-references on both sides.
fn bind_dependencies(derivation: &Arc<dyn Derivation>, new_observing: Vec<Arc<dyn Observable>>) {
    let id = derivation.id();
    let old_observing = derivation.observing();

    for obs in &new_observing {
        if !old_observing.iter().any(|o| o.id() == obs.id()) {
            obs.add_observer(derivation);
        }
    }
    for obs in &old_observing {
        if !new_observing.iter().any(|o| o.id() == obs.id()) {
            obs.remove_observer(id);
            if !obs.has_observers() {
                obs.on_become_unobserved();
            }
        }
    }
    derivation.replace_observing(new_observing);
}

/// Detach a derivation from every observable it reads and return it to the
/// never-ran state. Used on dispose/sleep and when a computed loses its
/// last observer.
pub(crate) fn clear_observing(derivation: &Arc<dyn Derivation>) {
    let id = derivation.id();
    for obs in derivation.observing() {
        obs.remove_observer(id);
        if !obs.has_observers() {
            obs.on_become_unobserved();
        }
    }
    derivation.replace_observing(Vec::new());
    derivation.set_dependencies_state(DerivationState::NotTracking);
}

/// Mark a derivation's own result stale and wave "maybe changed" at its
/// observers. Used after an untracked setter ran.
pub(crate) fn set_derivation_dirty(derivation: &Arc<dyn Derivation>) {
    if derivation.dependencies_state() != DerivationState::Stale {
        derivation.set_dependencies_state(DerivationState::Stale);
        derivation.on_become_dirty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caught_exception_extracts_str_message() {
        let err = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        let caught = CaughtException::from_payload(err);
        assert_eq!(caught.message(), "boom");
    }

    #[test]
    fn caught_exception_rethrows_original_payload() {
        let err = panic::catch_unwind(|| panic!("first")).unwrap_err();
        let caught = CaughtException::from_payload(err);
        let rethrown = panic::catch_unwind(AssertUnwindSafe(|| caught.rethrow())).unwrap_err();
        assert_eq!(rethrown.downcast_ref::<&str>(), Some(&"first"));
        // Payload is consumed; later rethrows fall back to the message.
        let again = panic::catch_unwind(AssertUnwindSafe(|| caught.rethrow())).unwrap_err();
        assert_eq!(again.downcast_ref::<String>().map(String::as_str), Some("first"));
    }

    #[test]
    fn state_roundtrip() {
        for s in [
            DerivationState::NotTracking,
            DerivationState::UpToDate,
            DerivationState::PossiblyStale,
            DerivationState::Stale,
        ] {
            assert_eq!(DerivationState::from_u8(s as u8), s);
        }
    }
}
