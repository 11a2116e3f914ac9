//! Spawning tasks onto the running scheduler, or onto a brand new scheduler
//! on its own OS thread.

use crate::context;
use crate::runtime::registry;
use crate::runtime::RuntimeConfig;
use crate::runtime::scheduler::Scheduler;
use crate::task::{Id, JoinHandle};
use crate::utils::thread::set_current_thread_name;
use std::rc::Rc;
use std::sync::mpsc;

/// Spawn a task on the current thread's scheduler.
///
/// The task is placed at the back of the ready queue and first runs at the
/// spawner's next suspension point.
///
/// # Panics
///
/// Panics when called from outside a runtime.
#[track_caller]
pub fn spawn<F>(f: F) -> JoinHandle
where
    F: FnOnce() + Send + 'static,
{
    context::with_scheduler(|s| JoinHandle::new(s.spawn(Box::new(f), false)))
}

/// Like [`spawn`], but without a handle on the outcome. Returns the task id.
#[track_caller]
pub fn spawn_detached<F>(f: F) -> Id
where
    F: FnOnce() + Send + 'static,
{
    context::with_scheduler(|s| s.spawn(Box::new(f), false).id())
}

/// Spawn a new scheduler on a new OS thread and run `f` as its root task.
///
/// The thread lives until its scheduler drains (its user tasks all finish)
/// or the process-wide shutdown cancels it. The configuration (stack size,
/// thread naming) is inherited from the spawner's runtime when called inside
/// one.
pub fn spawn_thread<F>(f: F) -> JoinHandle
where
    F: FnOnce() + Send + 'static,
{
    let cfg = context::try_with_scheduler(|s| s.config().clone()).unwrap_or_default();
    spawn_thread_with(cfg, f)
}

fn spawn_thread_with<F>(cfg: RuntimeConfig, f: F) -> JoinHandle
where
    F: FnOnce() + Send + 'static,
{
    let thread_name = cfg.thread_name.make();
    let (tx, rx) = mpsc::sync_channel(1);

    let builder = std::thread::Builder::new().name(thread_name.clone());
    builder
        .spawn(move || {
            set_current_thread_name(&thread_name);

            let scheduler = match Scheduler::try_new(cfg) {
                Ok(s) => Rc::new(s),
                Err(e) => panic!("FATAL: failed to build scheduler: {e:?}"),
            };

            let _ctx = match context::enter(scheduler.clone()) {
                Ok(guard) => guard,
                Err(e) => panic!("{e}"),
            };
            let _registration = registry::register_scheduler(scheduler.handle());

            let task = scheduler.spawn(Box::new(f), false);
            // The spawner is handed its JoinHandle before the loop starts.
            let _ = tx.send(JoinHandle::new(task));

            scheduler.run();
        })
        .expect("FATAL: failed to spawn scheduler thread");

    rx.recv()
        .expect("scheduler thread died before spawning its root task")
}

/// Cancel a task by id, from any thread. Returns false if no live task has
/// this id (it may already have finished).
pub fn cancel(id: Id) -> bool {
    registry::find_task(id).is_some_and(|task| task.cancel())
}

/// Ask every scheduler in the process to cancel all of its tasks.
pub fn shutdown() {
    registry::shutdown_all();
}

/// Print every scheduler's live tasks to stderr.
pub fn dump() {
    registry::dump_all();
}
