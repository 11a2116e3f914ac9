//! The rendez: a condition primitive whose waiters are tasks, bound to a
//! qutex at first use.

use crate::context;
use crate::sync::qutex::{Qutex, QutexGuard};
use crate::task::{State, TaskRef};
use crate::utils::ScopeGuard;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::trace;

#[derive(Debug, Default)]
struct Inner {
    /// FIFO of tasks parked in `sleep`.
    waiting: VecDeque<TaskRef>,

    /// The qutex this rendez was first used with; mixing qutexes across one
    /// rendez is a bug.
    bound_to: Option<*const Qutex>,
}

// Safety: the raw pointer is only ever compared, never dereferenced.
unsafe impl Send for Inner {}

/// Condition-variable analogue for tasks.
#[derive(Debug, Default)]
pub struct Rendez {
    inner: Mutex<Inner>,
}

impl Rendez {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release the guard's qutex, park until another task calls [`wakeup`]
    /// or [`wakeup_all`], then reacquire the qutex before returning.
    ///
    /// As with any condition primitive the caller must re-check its
    /// predicate in a loop. This is a cancellation point; on the cancel
    /// unwind the waiter is removed and the qutex is *not* reacquired (the
    /// guard's drop handles that tolerantly).
    ///
    /// [`wakeup`]: Rendez::wakeup
    /// [`wakeup_all`]: Rendez::wakeup_all
    #[track_caller]
    pub fn sleep(&self, guard: &mut QutexGuard<'_>) {
        let task = context::current_task().expect("rendez used outside of a task");
        task.set_status("rendez");

        {
            let mut inner = self.inner.lock();
            let qutex_ptr = std::ptr::from_ref(guard.qutex());
            let bound = *inner.bound_to.get_or_insert(qutex_ptr);
            assert!(
                std::ptr::eq(bound, qutex_ptr),
                "FATAL: rendez used with two different qutexes"
            );
            inner.waiting.push_back(task.clone());
        }

        // The user lock is released while parked and reacquired on the
        // normal path below. On the cancel unwind we only take ourselves
        // out of the waiter list.
        guard.qutex().unlock_raw();

        let waiter = task.clone();
        let mut bailout = ScopeGuard::new(|| {
            self.inner.lock().waiting.retain(|w| w.id() != waiter.id());
        });

        let _ = task.transition(State::Asleep);
        context::with_scheduler(|s| s.suspend());

        bailout.disarm();
        // Drop our entry if the wake was spurious rather than a wakeup().
        self.inner.lock().waiting.retain(|w| w.id() != task.id());

        guard.qutex().relock();
    }

    /// Ready the head waiter. The caller must hold the bound qutex.
    pub fn wakeup(&self) {
        let woken = self.inner.lock().waiting.pop_front();
        if let Some(task) = woken {
            trace!(task = %task.id(), "rendez wakeup");
            task.make_ready_on_owner();
        }
    }

    /// Ready every waiter. The caller must hold the bound qutex.
    pub fn wakeup_all(&self) {
        let woken: Vec<TaskRef> = self.inner.lock().waiting.drain(..).collect();
        for task in woken {
            trace!(task = %task.id(), "rendez wakeup_all");
            task.make_ready_on_owner();
        }
    }
}
