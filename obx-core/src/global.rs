//! Global Runtime State
//!
//! Process-wide counters and the dependency-tracking stack. The engine runs
//! in a single-threaded cooperative model, so all of this state lives in a
//! thread-local context object rather than true process globals; that keeps
//! the engine testable and re-entrant while preserving the "one logical
//! thread of control" contract.
//!
//! The tracking stack is manipulated strictly as a stack: a frame is pushed
//! when a derivation starts a tracked run and popped by a guard on every
//! exit path, including unwinds. An `Untracked` frame suspends dependency
//! registration for the reads beneath it.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use crate::error::{ObxError, Result};
use crate::observable::Observable;
use crate::reaction::Reaction;

/// Guard against runaway recursive computed evaluation.
pub(crate) const MAX_COMPUTATION_DEPTH: usize = 100;

/// Unique identity for observables and derivations.
///
/// Minted from a monotonically increasing counter in the global state, so
/// ids are unique per thread of control and reset with [`reset_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObxId(u64);

impl ObxId {
    /// Get the raw id value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A frame on the tracking stack.
enum Frame {
    /// A derivation is executing; reads register into `observed`.
    Tracking {
        derivation: ObxId,
        observed: Vec<Arc<dyn Observable>>,
    },
    /// Reads beneath this frame register nothing.
    Untracked,
}

struct GlobalState {
    guid: u64,
    batch_depth: usize,
    computation_depth: usize,
    stack: Vec<Frame>,
    pending_reactions: Vec<(u64, Arc<Reaction>)>,
    pending_seq: u64,
}

impl GlobalState {
    const fn new() -> Self {
        Self {
            guid: 0,
            batch_depth: 0,
            computation_depth: 0,
            stack: Vec::new(),
            pending_reactions: Vec::new(),
            pending_seq: 0,
        }
    }
}

thread_local! {
    static GLOBAL: RefCell<GlobalState> = RefCell::new(GlobalState::new());
}

/// Mint a fresh unique id.
pub(crate) fn next_id() -> ObxId {
    GLOBAL.with(|g| {
        let mut g = g.borrow_mut();
        g.guid += 1;
        ObxId(g.guid)
    })
}

/// True while some derivation is being tracked (and not suspended).
pub(crate) fn is_tracking() -> bool {
    GLOBAL.with(|g| matches!(g.borrow().stack.last(), Some(Frame::Tracking { .. })))
}

/// Register `obs` as read by the derivation on top of the tracking stack.
///
/// No-op outside a tracked run or under an `untracked` frame. Duplicate
/// reads of the same observable within one run collapse to one entry,
/// preserving first-read order.
pub(crate) fn observe(obs: &Arc<dyn Observable>) {
    GLOBAL.with(|g| {
        let mut g = g.borrow_mut();
        if let Some(Frame::Tracking {
            derivation,
            observed,
        }) = g.stack.last_mut()
        {
            let id = obs.id();
            if !observed.iter().any(|o| o.id() == id) {
                tracing::trace!(derivation = %derivation, observable = %obs.name(), "observed");
                observed.push(Arc::clone(obs));
            }
        }
    });
}

/// Scoped tracking frame; pops itself on drop if not finished explicitly.
pub(crate) struct FrameGuard {
    finished: bool,
}

impl FrameGuard {
    /// Pop the frame and return the observables read during it.
    pub(crate) fn finish(mut self) -> Vec<Arc<dyn Observable>> {
        self.finished = true;
        GLOBAL.with(|g| match g.borrow_mut().stack.pop() {
            Some(Frame::Tracking { observed, .. }) => observed,
            _ => Vec::new(),
        })
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if !self.finished {
            GLOBAL.with(|g| {
                g.borrow_mut().stack.pop();
            });
        }
    }
}

/// Enter a tracked run for `derivation`.
pub(crate) fn push_frame(derivation: ObxId) -> FrameGuard {
    GLOBAL.with(|g| {
        g.borrow_mut().stack.push(Frame::Tracking {
            derivation,
            observed: Vec::new(),
        });
    });
    FrameGuard { finished: false }
}

/// Scoped suspension of dependency tracking.
pub(crate) struct UntrackedGuard;

impl Drop for UntrackedGuard {
    fn drop(&mut self) {
        GLOBAL.with(|g| {
            g.borrow_mut().stack.pop();
        });
    }
}

pub(crate) fn untracked_guard() -> UntrackedGuard {
    GLOBAL.with(|g| g.borrow_mut().stack.push(Frame::Untracked));
    UntrackedGuard
}

/// Execute `f` with the tracking stack suspended: reads inside register no
/// dependencies.
pub fn untracked<T>(f: impl FnOnce() -> T) -> T {
    let _guard = untracked_guard();
    f()
}

pub(crate) fn batch_depth() -> usize {
    GLOBAL.with(|g| g.borrow().batch_depth)
}

pub(crate) fn enter_batch() {
    GLOBAL.with(|g| g.borrow_mut().batch_depth += 1);
}

/// Returns the new depth.
pub(crate) fn leave_batch() -> usize {
    GLOBAL.with(|g| {
        let mut g = g.borrow_mut();
        g.batch_depth = g.batch_depth.saturating_sub(1);
        g.batch_depth
    })
}

/// Scoped computation-depth accounting with the runaway-recursion cap.
pub(crate) struct ComputationGuard;

impl Drop for ComputationGuard {
    fn drop(&mut self) {
        GLOBAL.with(|g| {
            let mut g = g.borrow_mut();
            g.computation_depth = g.computation_depth.saturating_sub(1);
        });
    }
}

pub(crate) fn enter_computation(name: &str) -> Result<ComputationGuard> {
    GLOBAL.with(|g| {
        let mut g = g.borrow_mut();
        if g.computation_depth >= MAX_COMPUTATION_DEPTH {
            return Err(ObxError::ComputationDepthExceeded(name.to_string()));
        }
        g.computation_depth += 1;
        Ok(ComputationGuard)
    })
}

/// Park a reaction for execution once the outermost batch closes.
pub(crate) fn push_pending_reaction(reaction: Arc<Reaction>) {
    GLOBAL.with(|g| {
        let mut g = g.borrow_mut();
        g.pending_seq += 1;
        let seq = g.pending_seq;
        g.pending_reactions.push((seq, reaction));
    });
}

/// Drain parked reactions, ordered by (level, schedule order).
pub(crate) fn take_pending_reactions() -> Vec<Arc<Reaction>> {
    GLOBAL.with(|g| {
        let mut pending = std::mem::take(&mut g.borrow_mut().pending_reactions);
        pending.sort_by_key(|(seq, r)| (r.level(), *seq));
        pending.into_iter().map(|(_, r)| r).collect()
    })
}

/// Reset counters and stacks. For test isolation; live derivations created
/// before the reset keep their old ids.
pub(crate) fn reset_state() {
    GLOBAL.with(|g| {
        *g.borrow_mut() = GlobalState::new();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = next_id();
        let b = next_id();
        assert!(b.raw() > a.raw());
        assert_ne!(a, b);
    }

    #[test]
    fn frame_push_pop_balance() {
        assert!(!is_tracking());
        let guard = push_frame(next_id());
        assert!(is_tracking());
        let observed = guard.finish();
        assert!(observed.is_empty());
        assert!(!is_tracking());
    }

    #[test]
    fn untracked_suspends_tracking() {
        let guard = push_frame(next_id());
        assert!(is_tracking());
        untracked(|| {
            assert!(!is_tracking());
        });
        assert!(is_tracking());
        guard.finish();
    }

    #[test]
    fn batch_depth_is_reference_counted() {
        assert_eq!(batch_depth(), 0);
        enter_batch();
        enter_batch();
        assert_eq!(batch_depth(), 2);
        assert_eq!(leave_batch(), 1);
        assert_eq!(leave_batch(), 0);
    }

    #[test]
    fn computation_depth_cap() {
        let mut guards = Vec::new();
        for _ in 0..MAX_COMPUTATION_DEPTH {
            guards.push(enter_computation("t").unwrap());
        }
        assert!(enter_computation("t").is_err());
        drop(guards);
        assert!(enter_computation("t").is_ok());
    }
}
