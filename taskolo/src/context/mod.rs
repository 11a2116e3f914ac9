//! Thread-local access to the scheduler running on the current thread.

use crate::runtime::scheduler::Scheduler;
use crate::task::{SchedulerId, TaskRef};
use anyhow::{Result, anyhow};
use std::cell::RefCell;
use std::rc::Rc;

thread_local! {
    static SCHEDULER: RefCell<Option<Rc<Scheduler>>> = const { RefCell::new(None) };
}

/// Install `scheduler` as this thread's scheduler for the guard's lifetime.
///
/// Exactly one scheduler may be active per thread; a second `enter` fails
/// until the first guard is dropped.
pub(crate) fn enter(scheduler: Rc<Scheduler>) -> Result<ContextGuard> {
    SCHEDULER.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_some() {
            return Err(anyhow!(
                "Cannot start a runtime: a scheduler is already active on this thread."
            ));
        }
        *slot = Some(scheduler);
        Ok(ContextGuard)
    })
}

pub(crate) struct ContextGuard;

impl Drop for ContextGuard {
    fn drop(&mut self) {
        SCHEDULER.with(|cell| cell.borrow_mut().take());
    }
}

/// The current thread's scheduler.
///
/// The returned `Rc` must not be held across a suspension that can migrate
/// the task (see `scheduler::suspend_current`); ordinary suspension points
/// resume on the same thread and may hold it freely.
#[track_caller]
pub(crate) fn scheduler() -> Rc<Scheduler> {
    SCHEDULER
        .with(|cell| cell.borrow().clone())
        .expect("not inside a taskolo runtime")
}

/// Run `f` with the current thread's scheduler, or `None` outside a runtime.
///
/// The `Rc` is cloned out of the thread-local cell before `f` runs, so `f`
/// may suspend the current task without holding a `RefCell` borrow.
pub(crate) fn try_with_scheduler<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&Scheduler) -> R,
{
    let scheduler = SCHEDULER.with(|cell| cell.borrow().clone());
    scheduler.map(|s| f(&s))
}

#[track_caller]
pub(crate) fn with_scheduler<F, R>(f: F) -> R
where
    F: FnOnce(&Scheduler) -> R,
{
    try_with_scheduler(f).expect("not inside a taskolo runtime")
}

/// The task currently running on this thread, if any. `None` on the
/// scheduler's main context or outside a runtime.
pub(crate) fn current_task() -> Option<TaskRef> {
    try_with_scheduler(|s| s.current_task()).flatten()
}

pub(crate) fn current_scheduler_id() -> Option<SchedulerId> {
    try_with_scheduler(|s| s.id())
}
