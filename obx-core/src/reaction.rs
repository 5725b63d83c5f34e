//! Eager reactions: side-effecting derivations.
//!
//! A reaction tracks a handler closure and re-runs it when any dependency
//! confirms a change. Scheduling is where lazy and eager worlds meet: a
//! dirty reaction parks itself in the global pending list, and the
//! outermost batch close drains that list — synchronous reactions run
//! right there, asynchronous ones are handed to the next-tick scheduler
//! and coalesce across the tick.
//!
//! Undisposed reactions are kept alive by a thread-local registry, so a
//! caller may drop the [`Disposer`] without tearing the reaction down.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::derivation::{
    clear_observing, should_compute, track, CaughtException, Derivation, DerivationState,
};
use crate::global::{self, ObxId};
use crate::observable::{end_batch, start_batch, Observable};

/// Safety valve for reactions that keep scheduling each other.
const MAX_REACTION_ITERATIONS: usize = 100;

/// An eager side-effecting observer of the dependency graph.
pub struct Reaction {
    id: ObxId,
    name: String,
    level: i32,
    sync: bool,
    throttle: Duration,
    handler: Box<dyn Fn() + Send + Sync>,
    deps_state: AtomicU8,
    observing: Mutex<SmallVec<[Arc<dyn Observable>; 4]>>,
    scheduled: AtomicBool,
    sleeping: AtomicBool,
    disposed: AtomicBool,
    last_run: Mutex<Option<Instant>>,
    caught: Mutex<Option<CaughtException>>,
    weak_self: Weak<Reaction>,
}

impl Reaction {
    /// Create a reaction in the never-ran state. It runs for the first time
    /// when [`run`] is called (or via [`autorun`], which does so
    /// immediately). Reactions must be disposed explicitly; dropping every
    /// handle does not tear one down.
    ///
    /// [`run`]: Reaction::run
    pub fn new(
        name: &str,
        handler: impl Fn() + Send + Sync + 'static,
        options: AutorunOptions,
    ) -> Arc<Self> {
        let handler: Box<dyn Fn() + Send + Sync> = Box::new(handler);
        let id = global::next_id();
        let reaction = Arc::new_cyclic(|weak| Self {
            id,
            name: format!("{name}@{id}"),
            level: options.level,
            sync: options.sync,
            throttle: options.throttle.unwrap_or(Duration::ZERO),
            handler,
            deps_state: AtomicU8::new(DerivationState::NotTracking as u8),
            observing: Mutex::new(SmallVec::new()),
            scheduled: AtomicBool::new(false),
            sleeping: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            last_run: Mutex::new(None),
            caught: Mutex::new(None),
            weak_self: weak.clone(),
        });
        REGISTRY.with(|r| r.borrow_mut().push(reaction.clone()));
        reaction
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drain ordering key; lower levels run first within a flush.
    pub(crate) fn level(&self) -> i32 {
        self.level
    }

    fn as_derivation(&self) -> Arc<dyn Derivation> {
        self.weak_self.upgrade().expect("reaction still registered") as Arc<dyn Derivation>
    }

    /// Execute the handler now, tracked and bypassing the scheduler. For
    /// consumers that need up-to-date output immediately. A handler panic
    /// is contained (see [`caught_message`]) and the reaction still settles,
    /// so it will not retry every tick.
    ///
    /// [`caught_message`]: Reaction::caught_message
    pub fn run(&self) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.scheduled.store(false, Ordering::SeqCst);
        *self.last_run.lock() = Some(Instant::now());
        debug!(reaction = %self.name, "run");
        start_batch();
        let d = self.as_derivation();
        match track(&d, || (self.handler)()) {
            Ok(()) => *self.caught.lock() = None,
            Err(caught) => {
                warn!(reaction = %self.name, error = caught.message(), "handler failed");
                *self.caught.lock() = Some(caught);
            }
        }
        end_batch();
    }

    /// Mark dirty and park for the current batch (or drain immediately when
    /// no batch is open). Idempotent while already scheduled.
    pub(crate) fn schedule(&self) {
        if self.disposed.load(Ordering::SeqCst) || self.sleeping.load(Ordering::SeqCst) {
            return;
        }
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let me = self.weak_self.upgrade().expect("reaction still registered");
        global::push_pending_reaction(me);
        if global::batch_depth() == 0 {
            run_pending_reactions();
        }
    }

    /// Scheduled entry point: re-check whether any dependency actually
    /// changed and run only then. Throttled reactions that fired too
    /// recently stay scheduled and retry on the next flush.
    pub(crate) fn flush_run(&self) {
        if self.disposed.load(Ordering::SeqCst) || self.sleeping.load(Ordering::SeqCst) {
            self.scheduled.store(false, Ordering::SeqCst);
            return;
        }
        if !self.throttle.is_zero() {
            let last = *self.last_run.lock();
            if let Some(last) = last {
                if last.elapsed() < self.throttle {
                    let me = self.weak_self.upgrade().expect("reaction still registered");
                    crate::scheduler::enqueue_reaction(me);
                    return;
                }
            }
        }
        self.scheduled.store(false, Ordering::SeqCst);
        let d = self.as_derivation();
        match should_compute(&d) {
            Ok(true) => self.run(),
            Ok(false) => {}
            Err(e) => {
                warn!(reaction = %self.name, error = %e, "settle failed");
                *self.caught.lock() = Some(CaughtException::from_message(e.to_string()));
            }
        }
    }

    /// Detach from all dependencies and ignore changes until [`wakeup`].
    ///
    /// [`wakeup`]: Reaction::wakeup
    pub fn sleep(&self) {
        if self.sleeping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduled.store(false, Ordering::SeqCst);
        clear_observing(&self.as_derivation());
    }

    /// Resume after [`sleep`]: re-track immediately when `sync`, otherwise
    /// schedule for the next drain.
    ///
    /// [`sleep`]: Reaction::sleep
    pub fn wakeup(&self, sync: bool) {
        if !self.sleeping.swap(false, Ordering::SeqCst) || self.disposed.load(Ordering::SeqCst) {
            return;
        }
        if sync {
            self.run();
        } else {
            self.schedule();
        }
    }

    /// Whether some dependency has signalled since the last run.
    pub fn is_dirty(&self) -> bool {
        matches!(
            DerivationState::from_u8(self.deps_state.load(Ordering::SeqCst)),
            DerivationState::PossiblyStale | DerivationState::Stale
        )
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// The failure contained during the most recent run, if that run
    /// failed. Cleared by a later successful run.
    pub fn caught_exception(&self) -> Option<CaughtException> {
        self.caught.lock().clone()
    }

    /// Message of the contained failure, if the most recent run failed.
    pub fn caught_message(&self) -> Option<String> {
        self.caught.lock().as_ref().map(|c| c.message().to_string())
    }

    /// Permanently detach. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        clear_observing(&self.as_derivation());
        let id = self.id;
        REGISTRY.with(|r| r.borrow_mut().retain(|other| other.id != id));
    }
}

impl Derivation for Reaction {
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
        if let Some(me) = self.weak_self.upgrade() {
            me.schedule();
        }
    }
}

thread_local! {
    /// Keeps undisposed reactions alive independent of caller handles.
    static REGISTRY: RefCell<Vec<Arc<Reaction>>> = const { RefCell::new(Vec::new()) };
    static DRAINING: Cell<bool> = const { Cell::new(false) };
}

/// Drain the pending list: synchronous reactions run here, asynchronous
/// ones move to the next-tick scheduler. Re-entrant calls fold into the
/// outer drain.
pub(crate) fn run_pending_reactions() {
    if DRAINING.with(|d| d.replace(true)) {
        return;
    }
    struct DrainReset;
    impl Drop for DrainReset {
        fn drop(&mut self) {
            DRAINING.with(|d| d.set(false));
        }
    }
    let _reset = DrainReset;

    let mut iterations = 0;
    loop {
        let pending = global::take_pending_reactions();
        if pending.is_empty() {
            break;
        }
        iterations += 1;
        if iterations > MAX_REACTION_ITERATIONS {
            warn!("reaction drain did not settle after {MAX_REACTION_ITERATIONS} iterations");
            break;
        }
        for reaction in pending {
            if reaction.sync {
                reaction.flush_run();
            } else {
                crate::scheduler::enqueue_reaction(reaction);
            }
        }
    }
}

/// Dispose every registered reaction. For test isolation.
pub(crate) fn clear_reactions() {
    let all = REGISTRY.with(|r| std::mem::take(&mut *r.borrow_mut()));
    for reaction in all {
        reaction.dispose();
    }
}

/// Tuning knobs for [`autorun_with`].
#[derive(Default)]
pub struct AutorunOptions {
    /// Debug name; surfaces in logs.
    pub name: Option<String>,
    /// Drain priority: lower levels run first within a flush.
    pub level: i32,
    /// Run re-executions inline at batch close instead of on the next tick.
    pub sync: bool,
    /// Minimum interval between runs; a change arriving inside the window
    /// keeps the reaction scheduled until the window elapses.
    pub throttle: Option<Duration>,
}

/// Owner handle for a reaction created with [`autorun`].
///
/// Dropping the handle does not dispose the reaction; call
/// [`Disposer::dispose`].
pub struct Disposer {
    reaction: Arc<Reaction>,
}

impl Disposer {
    pub fn dispose(&self) {
        self.reaction.dispose();
    }

    pub fn sleep(&self) {
        self.reaction.sleep();
    }

    pub fn wakeup(&self, sync: bool) {
        self.reaction.wakeup(sync);
    }

    pub fn is_disposed(&self) -> bool {
        self.reaction.is_disposed()
    }

    pub fn is_dirty(&self) -> bool {
        self.reaction.is_dirty()
    }

    pub fn reaction(&self) -> &Reaction {
        &self.reaction
    }
}

/// Run `handler` now, tracked, and re-run it whenever a dependency
/// confirms a change. Re-runs are scheduled on the next tick.
pub fn autorun(handler: impl Fn() + Send + Sync + 'static) -> Disposer {
    autorun_with(handler, AutorunOptions::default())
}

/// [`autorun`] with explicit scheduling options. The first run is always
/// immediate and synchronous.
pub fn autorun_with(
    handler: impl Fn() + Send + Sync + 'static,
    options: AutorunOptions,
) -> Disposer {
    let name = options.name.clone().unwrap_or_else(|| "Autorun".to_string());
    let reaction = Reaction::new(&name, handler, options);
    reaction.run();
    Disposer { reaction }
}
