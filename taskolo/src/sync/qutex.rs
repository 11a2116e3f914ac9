//! The qutex: a task-aware mutex. Blocked acquirers are tasks, not OS
//! threads, so a held qutex never parks a scheduler.
//!
//! Two locks cooperate here. A small internal OS mutex protects the owner
//! slot and the FIFO waiter list across threads; task-level blocking and the
//! unlock hand-off are expressed purely in `ready`/suspend terms, keeping
//! the task state machine authoritative.

use crate::context;
use crate::task::{State, TaskRef};
use crate::utils::ScopeGuard;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Default)]
struct Inner {
    owner: Option<TaskRef>,
    /// FIFO of tasks blocked in `lock`.
    waiting: VecDeque<TaskRef>,
}

/// A task-aware mutual exclusion primitive.
///
/// Non-owners queue in FIFO order; unlock hands ownership to the head waiter
/// atomically. Recursive locking by the same task is forbidden.
#[derive(Debug, Default)]
pub struct Qutex {
    inner: Mutex<Inner>,
}

/// RAII guard: the qutex unlocks when this is dropped.
#[derive(Debug)]
pub struct QutexGuard<'a> {
    qutex: &'a Qutex,
}

impl Qutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the qutex, suspending the current task while another task
    /// owns it. This is a cancellation point; on the cancel unwind the
    /// caller is removed from the waiter list (or ownership is passed on if
    /// the hand-off already happened).
    ///
    /// # Panics
    ///
    /// Panics on recursive locking or when called from outside a task.
    #[track_caller]
    pub fn lock(&self) -> QutexGuard<'_> {
        self.lock_raw();
        QutexGuard { qutex: self }
    }

    /// Acquire without suspending. `None` if another task owns the qutex.
    #[track_caller]
    pub fn try_lock(&self) -> Option<QutexGuard<'_>> {
        let task = current_task();
        let mut inner = self.inner.lock();
        assert_no_recursion(&inner, &task);

        if inner.owner.is_none() {
            inner.owner = Some(task);
            Some(QutexGuard { qutex: self })
        } else {
            None
        }
    }

    /// Acquire, giving up after `timeout`. `None` on timeout; the caller has
    /// been removed from the waiter list. This is a cancellation point.
    #[track_caller]
    pub fn try_lock_for(&self, timeout: Duration) -> Option<QutexGuard<'_>> {
        let task = current_task();

        {
            let mut inner = self.inner.lock();
            assert_no_recursion(&inner, &task);

            if inner.owner.is_none() {
                inner.owner = Some(task);
                return Some(QutexGuard { qutex: self });
            }
            inner.waiting.push_back(task.clone());
        }

        let acquired = context::with_scheduler(|s| {
            let deadline = s.now() + timeout;
            let timer = task.arm_timer(deadline, None);
            s.resync_timers(&task);

            let timer_task = task.clone();
            let _timer_cleanup = ScopeGuard::new(|| {
                timer_task.disarm_timer(timer);
                s.resync_timers(&timer_task);
            });

            let mut bailout = self.waiter_bailout(&task);

            loop {
                let _ = task.transition(State::Asleep);
                s.suspend();

                if self.owned_by(&task) {
                    bailout.disarm();
                    return true;
                }
                if s.now() >= deadline {
                    // `bailout` removes us from the waiter list (or passes
                    // ownership along if the hand-off races the timeout).
                    return false;
                }
            }
        });

        acquired.then_some(QutexGuard { qutex: self })
    }

    fn lock_raw(&self) {
        let task = current_task();

        {
            let mut inner = self.inner.lock();
            assert_no_recursion(&inner, &task);

            if inner.owner.is_none() {
                inner.owner = Some(task);
                trace!(qutex = ?std::ptr::from_ref(self), "locked uncontended");
                return;
            }
            inner.waiting.push_back(task.clone());
        }

        context::with_scheduler(|s| {
            let mut bailout = self.waiter_bailout(&task);

            // Loop: wakes can be spurious when another thread's waker races
            // the hand-off, so ownership is re-checked after every resume.
            loop {
                let _ = task.transition(State::Asleep);
                s.suspend();

                if self.owned_by(&task) {
                    bailout.disarm();
                    return;
                }
            }
        });
    }

    /// Cleanup for a waiter leaving `lock` on the cancel unwind: remove it
    /// from the waiter list, or release ownership if the unlock hand-off
    /// made it the owner while it was already unwinding.
    fn waiter_bailout(&self, task: &TaskRef) -> ScopeGuard<impl FnOnce()> {
        let task = task.clone();
        ScopeGuard::new(move || {
            let mut inner = self.inner.lock();
            if inner.owner.as_ref().is_some_and(|o| o.id() == task.id()) {
                Self::pass_on(&mut inner);
            } else {
                inner.waiting.retain(|w| w.id() != task.id());
            }
        })
    }

    fn owned_by(&self, task: &TaskRef) -> bool {
        self.inner
            .lock()
            .owner
            .as_ref()
            .is_some_and(|o| o.id() == task.id())
    }

    /// Hand ownership to the head waiter (readying it on its scheduler), or
    /// clear it. Caller holds the internal mutex; the ready happens after it
    /// is released.
    fn pass_on(inner: &mut parking_lot::MutexGuard<'_, Inner>) {
        let next = inner.waiting.pop_front();
        inner.owner = next.clone();

        if let Some(next) = next {
            trace!(new_owner = %next.id(), "qutex handed off");
            // Must not hold the internal mutex while readying: the target
            // scheduler's wake path may contend on it.
            parking_lot::MutexGuard::unlocked(inner, || next.make_ready_on_owner());
        }
    }

    pub(crate) fn unlock_raw(&self) {
        let task = current_task();
        let mut inner = self.inner.lock();

        if inner.owner.as_ref().is_some_and(|o| o.id() == task.id()) {
            Self::pass_on(&mut inner);
        } else {
            // Reached only via exception-driven cleanup from inside `lock`;
            // the unwinding waiter takes itself out of the queue.
            inner.waiting.retain(|w| w.id() != task.id());
        }
    }

    /// Used by `Rendez::sleep` to release the user lock while parking.
    pub(crate) fn relock(&self) {
        self.lock_raw();
    }
}

impl Drop for QutexGuard<'_> {
    fn drop(&mut self) {
        self.qutex.unlock_raw();
    }
}

impl<'a> QutexGuard<'a> {
    pub(crate) fn qutex(&self) -> &'a Qutex {
        self.qutex
    }
}

#[track_caller]
fn current_task() -> TaskRef {
    context::current_task().expect("qutex used outside of a task")
}

#[track_caller]
fn assert_no_recursion(inner: &Inner, task: &TaskRef) {
    assert!(
        !inner.owner.as_ref().is_some_and(|o| o.id() == task.id()),
        "FATAL: recursive qutex lock by {}",
        task.id()
    );
}
