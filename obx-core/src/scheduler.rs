//! Next-tick scheduler.
//!
//! Asynchronous reactions and deferred callbacks coalesce on a logical
//! tick. The model is cooperative and single-threaded: no background
//! thread advances time. Instead, awaiting [`next_tick`] performs the
//! flush itself on first poll, then resolves; an await issued while a
//! flush is already in progress parks until that flush completes and the
//! tick advances.
//!
//! Within one flush, reactions run before tick callbacks, ordered by
//! level (stable, so same-level reactions keep their enqueue order). Work
//! enqueued during a flush lands on the following tick.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use tracing::trace;

use crate::reaction::Reaction;

struct SchedulerState {
    tick: u64,
    flushing: bool,
    reactions: Vec<Arc<Reaction>>,
    callbacks: Vec<Box<dyn FnOnce()>>,
    wakers: Vec<Waker>,
}

impl SchedulerState {
    const fn new() -> Self {
        Self {
            tick: 0,
            flushing: false,
            reactions: Vec::new(),
            callbacks: Vec::new(),
            wakers: Vec::new(),
        }
    }
}

thread_local! {
    static SCHED: RefCell<SchedulerState> = RefCell::new(SchedulerState::new());
}

/// Park a reaction for the next flush.
pub(crate) fn enqueue_reaction(reaction: Arc<Reaction>) {
    SCHED.with(|s| s.borrow_mut().reactions.push(reaction));
}

/// Run `callback` after the next flush's reactions have settled.
pub fn next_tick_with(callback: impl FnOnce() + 'static) {
    SCHED.with(|s| s.borrow_mut().callbacks.push(Box::new(callback)));
}

/// Resolve after the current tick's scheduled work has run.
pub fn next_tick() -> NextTick {
    NextTick {
        target: SCHED.with(|s| s.borrow().tick),
    }
}

/// Future returned by [`next_tick`].
pub struct NextTick {
    target: u64,
}

impl Future for NextTick {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let (done, flushing) = SCHED.with(|s| {
            let s = s.borrow();
            (s.tick > self.target, s.flushing)
        });
        if done {
            return Poll::Ready(());
        }
        if flushing {
            SCHED.with(|s| s.borrow_mut().wakers.push(cx.waker().clone()));
            return Poll::Pending;
        }
        flush();
        Poll::Ready(())
    }
}

/// Run one tick: level-ordered reactions, then callbacks, then advance the
/// tick counter and wake parked awaiters.
fn flush() {
    let (mut reactions, callbacks) = SCHED.with(|s| {
        let mut s = s.borrow_mut();
        s.flushing = true;
        (std::mem::take(&mut s.reactions), std::mem::take(&mut s.callbacks))
    });
    trace!(reactions = reactions.len(), callbacks = callbacks.len(), "tick flush");

    reactions.sort_by_key(|r| r.level());
    for reaction in reactions {
        reaction.flush_run();
    }
    for callback in callbacks {
        callback();
    }

    let wakers = SCHED.with(|s| {
        let mut s = s.borrow_mut();
        s.tick += 1;
        s.flushing = false;
        std::mem::take(&mut s.wakers)
    });
    for waker in wakers {
        waker.wake();
    }
}

/// Drop all scheduled work and parked awaiters. For test isolation.
pub(crate) fn clear_ticks() {
    SCHED.with(|s| {
        *s.borrow_mut() = SchedulerState::new();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[tokio::test]
    async fn tick_runs_callbacks_in_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let a = order.clone();
        let b = order.clone();
        next_tick_with(move || a.borrow_mut().push("first"));
        next_tick_with(move || b.borrow_mut().push("second"));
        next_tick().await;
        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn work_enqueued_during_flush_waits_for_next_tick() {
        let ran = Rc::new(Cell::new(false));
        let ran_clone = ran.clone();
        next_tick_with(move || {
            let inner = ran_clone.clone();
            next_tick_with(move || inner.set(true));
        });
        next_tick().await;
        assert!(!ran.get());
        next_tick().await;
        assert!(ran.get());
    }

    #[tokio::test]
    async fn empty_tick_still_advances() {
        let before = SCHED.with(|s| s.borrow().tick);
        next_tick().await;
        let after = SCHED.with(|s| s.borrow().tick);
        assert_eq!(after, before + 1);
    }
}
