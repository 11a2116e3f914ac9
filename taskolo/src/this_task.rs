//! Operations on the currently running task.

use crate::context;
use crate::runtime::registry;
use crate::runtime::scheduler;
use crate::task::{Id, State, TaskRef};
use crate::utils::ScopeGuard;
use std::time::{Duration, Instant};

#[track_caller]
fn current() -> TaskRef {
    context::current_task().expect("not running inside a task")
}

/// Id of the current task.
///
/// # Panics
///
/// Panics when called from outside a task. See [`try_id`] for a
/// non-panicking variant.
#[track_caller]
pub fn id() -> Id {
    current().id()
}

/// Id of the current task, or `None` outside of one.
pub fn try_id() -> Option<Id> {
    context::current_task().map(|t| t.id())
}

/// Let other tasks run; the current task goes to the back of its
/// scheduler's ready queue. This is a cancellation point.
///
/// Returns how many other tasks ran before control came back. If the task is
/// the only runnable one, yield returns 0 with the same task running.
#[track_caller]
pub fn yield_now() -> u64 {
    let task = current();
    task.set_status("yield");

    context::with_scheduler(|s| {
        let before = s.nswitch();
        s.make_ready(task.clone());
        s.suspend();
        s.nswitch().saturating_sub(before + 1)
    })
}

/// Sleep until the monotonic instant `when`. This is a cancellation point.
#[track_caller]
pub fn sleep_until(when: Instant) {
    let task = current();
    task.set_status("sleep");

    context::with_scheduler(|s| {
        let timer = task.arm_timer(when, None);
        s.resync_timers(&task);

        // On the cancel unwind the timer has not been consumed; drop it so
        // the scheduler does not keep a dead deadline around.
        let cleanup_task = task.clone();
        let _cleanup = ScopeGuard::new(|| {
            cleanup_task.disarm_timer(timer);
            s.resync_timers(&cleanup_task);
        });

        let _ = task.transition(State::Asleep);
        s.suspend();
    });
}

/// Sleep for at least `duration`. This is a cancellation point.
///
/// Measured against a fresh monotonic reading, not the scheduler's cached
/// time: a task may have been computing for a while since the loop last
/// refreshed it.
#[track_caller]
pub fn sleep_for(duration: Duration) {
    sleep_until(Instant::now() + duration);
}

/// Get the current task's diagnostic name (defaults to `task[{id}]`).
#[track_caller]
pub fn name() -> String {
    current().name()
}

/// Set the current task's diagnostic name, shown by the task dump.
#[track_caller]
pub fn set_name(name: impl Into<String>) {
    current().set_name(name);
}

/// Get the current task's diagnostic status label.
#[track_caller]
pub fn status() -> String {
    current().status()
}

/// Set the current task's diagnostic status label. The runtime overwrites
/// it at suspension points ("sleep", "yield", "fdwait", ...).
#[track_caller]
pub fn set_status(status: impl Into<String>) {
    current().set_status(status);
}

/// Flag the current task as a system task. System tasks do not keep their
/// scheduler alive: once only system tasks remain, they are canceled and
/// the scheduler exits.
#[track_caller]
pub fn make_system() {
    context::with_scheduler(|s| s.make_current_system());
}

/// Move the current task to another scheduler. Returns false (without
/// suspending) when no other scheduler exists.
///
/// The task parks itself; its current scheduler hands it over once it is
/// fully off this thread's stack, and it resumes on the target's thread.
/// This is a cancellation point.
#[track_caller]
pub fn migrate() -> bool {
    let task = current();
    let from = context::current_scheduler_id().expect("not inside a taskolo runtime");

    let Some(target) = registry::pick_other(from) else {
        return false;
    };

    task.set_status("migrating");
    task.request_migrate(target);
    let _ = task.transition(State::Asleep);

    // Deliberately no scheduler reference held here: we resume on another
    // thread (see suspend_current).
    drop(task);
    scheduler::suspend_current();
    true
}
