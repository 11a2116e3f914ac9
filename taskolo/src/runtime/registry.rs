//! Process-wide registries: every live scheduler (for shutdown fan-out,
//! migration targets, and diagnostic dumps) and every live task (for
//! cancel-by-id from any thread).

use crate::runtime::scheduler::Handle;
use crate::task::{Id, SchedulerId, TaskRef};
use dashmap::DashMap;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering};

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

#[derive(Debug)]
struct Registry {
    schedulers: DashMap<SchedulerId, Handle>,

    // Kept separately because DashMap::len iterates every shard.
    scheduler_count: AtomicUsize,

    tasks: DashMap<Id, TaskRef>,
}

impl Registry {
    fn new() -> Self {
        Registry {
            schedulers: DashMap::new(),
            scheduler_count: AtomicUsize::new(0),
            tasks: DashMap::new(),
        }
    }
}

/// Register a scheduler; the guard deregisters it when the loop exits.
pub(crate) fn register_scheduler(handle: Handle) -> SchedulerRegistration {
    let id = handle.id();
    REGISTRY.schedulers.insert(id, handle);
    REGISTRY.scheduler_count.fetch_add(1, Ordering::AcqRel);
    SchedulerRegistration { id }
}

pub(crate) struct SchedulerRegistration {
    id: SchedulerId,
}

impl Drop for SchedulerRegistration {
    fn drop(&mut self) {
        if REGISTRY.schedulers.remove(&self.id).is_some() {
            REGISTRY.scheduler_count.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

pub(crate) fn scheduler_count() -> usize {
    REGISTRY.scheduler_count.load(Ordering::Acquire)
}

/// Any registered scheduler other than `from`; used as a migration target.
pub(crate) fn pick_other(from: SchedulerId) -> Option<Handle> {
    REGISTRY
        .schedulers
        .iter()
        .find(|entry| *entry.key() != from)
        .map(|entry| entry.value().clone())
}

/// Ask every scheduler to cancel all of its tasks.
pub(crate) fn shutdown_all() {
    for entry in REGISTRY.schedulers.iter() {
        entry.value().request_shutdown();
    }
}

/// Ask every scheduler to print its live tasks to stderr.
pub(crate) fn dump_all() {
    for entry in REGISTRY.schedulers.iter() {
        entry.value().request_dump();
    }
}

// --- task registry ---

pub(crate) fn register_task(task: &TaskRef) {
    REGISTRY.tasks.insert(task.id(), task.clone());
}

pub(crate) fn deregister_task(id: Id) {
    REGISTRY.tasks.remove(&id);
}

pub(crate) fn find_task(id: Id) -> Option<TaskRef> {
    REGISTRY.tasks.get(&id).map(|entry| entry.value().clone())
}
