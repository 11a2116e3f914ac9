//! The task: identity, entry function, stack, saved CPU state, timers, and
//! the cancellation machinery.
//!
//! Every task is shared as `Arc<Task>` between three parties, in the spirit
//! of the usual three-reference model:
//!
//! 1. `JoinHandle`: owned by whoever wants the terminal outcome
//! 2. queue slots: ready queue / wake queue / waiter lists, transient
//! 3. the owner scheduler's `all_tasks` map, which keeps the task alive
//!
//! The scheduler-owned reference is authoritative: a task never outlives its
//! scheduler's map entry plus whatever handles are still around, and its
//! stack is reclaimed only after the task has swapped off of it for good.

pub(crate) mod cpu;
pub(crate) mod stack;
pub(crate) mod state;
pub(crate) mod timer;

mod id;
pub use id::Id;
pub(crate) use id::SchedulerId;
pub use state::State;

use crate::context;
use crate::error::Interrupt;
use crate::runtime::scheduler::Handle;
use crate::task::cpu::CpuContext;
use crate::task::stack::Stack;
use crate::task::state::AtomicState;
use crate::task::timer::{TimerId, TimerSet};
use crate::utils::ScopeGuard;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::time::Instant;
use tracing::trace;

pub(crate) type TaskBody = Box<dyn FnOnce() + Send + 'static>;

pub(crate) type TaskRef = Arc<Task>;

/// How a task terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The body ran to completion.
    Completed,
    /// The task was canceled before or during its body (including a deadline
    /// interrupt that escaped the body).
    Canceled,
}

const OUTCOME_UNSET: u8 = 0;
const OUTCOME_COMPLETED: u8 = 1;
const OUTCOME_CANCELED: u8 = 2;

/// Human-readable diagnostic labels, shown by the task dump.
#[derive(Debug)]
struct Labels {
    name: String,
    status: String,
}

pub(crate) struct Task {
    id: Id,

    state: AtomicState,

    /// Ready-queue membership. Wakes of an already-ready task coalesce on
    /// this flag instead of duplicating the queue entry.
    is_ready: AtomicBool,

    /// System tasks do not count toward the user-task population that keeps
    /// a scheduler alive.
    is_system: AtomicBool,

    /// Nested cancellation-point scopes currently on this task's stack.
    /// Only the task itself moves it; relaxed ordering is enough.
    cancel_points: AtomicU32,

    outcome: AtomicU8,

    /// Set by the io driver when readiness (not a timeout) woke this task.
    io_ready: AtomicBool,

    /// Taken exactly once, by the trampoline.
    entry: Mutex<Option<TaskBody>>,

    cpu: UnsafeCell<CpuContext>,

    stack: UnsafeCell<Option<Stack>>,

    /// The scheduler hosting this task. Changes only through an explicit
    /// migrate, and only while the task is fully suspended.
    owner: Mutex<Handle>,

    timers: Mutex<TimerSet>,

    /// At most one interrupt to deliver on next resume.
    pending: Mutex<Option<Interrupt>>,

    labels: Mutex<Labels>,

    /// Tasks parked in `join` on this task.
    joiners: Mutex<Vec<TaskRef>>,

    /// Destination recorded by `this_task::migrate`, honored by the owner
    /// loop once the task is off its stack.
    migrate_to: Mutex<Option<Handle>>,
}

// Safety: the mutable interior is compartmentalized. `cpu` and `stack` are
// only touched by the thread that currently hosts the task, while it runs
// there, or from the owner loop while it is fully suspended. Everything else
// is behind atomics or mutexes.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Build a task whose first swap-in enters `trampoline` on `stack`.
    pub(crate) fn new(
        body: TaskBody,
        stack: Stack,
        owner: Handle,
        trampoline: extern "C" fn() -> !,
    ) -> TaskRef {
        let id = Id::next();

        let mut cpu = CpuContext::new();
        // Safety: the stack is owned by this task and freed only after the
        // task finished and swapped away for the last time.
        unsafe {
            cpu.init(trampoline, stack.top());
        }

        Arc::new(Task {
            id,
            state: AtomicState::new(State::Fresh),
            is_ready: AtomicBool::new(false),
            is_system: AtomicBool::new(false),
            cancel_points: AtomicU32::new(0),
            outcome: AtomicU8::new(OUTCOME_UNSET),
            io_ready: AtomicBool::new(false),
            entry: Mutex::new(Some(body)),
            cpu: UnsafeCell::new(cpu),
            stack: UnsafeCell::new(Some(stack)),
            owner: Mutex::new(owner),
            timers: Mutex::new(TimerSet::default()),
            pending: Mutex::new(None),
            labels: Mutex::new(Labels {
                name: format!("task[{id}]"),
                status: "new".to_string(),
            }),
            joiners: Mutex::new(Vec::new()),
            migrate_to: Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn state(&self) -> State {
        self.state.load()
    }

    pub(crate) fn transition(&self, to: State) -> Option<State> {
        self.state.transition(to)
    }

    // --- scheduling flags ---

    /// Claim ready-queue membership. Returns true if the caller should
    /// actually enqueue (i.e. the task was not already queued).
    pub(crate) fn claim_ready(&self) -> bool {
        !self.is_ready.swap(true, Ordering::AcqRel)
    }

    /// Called by the owner loop right before swapping the task in.
    pub(crate) fn clear_ready(&self) {
        self.is_ready.store(false, Ordering::Release);
    }

    pub(crate) fn is_system(&self) -> bool {
        self.is_system.load(Ordering::Acquire)
    }

    /// Flag this task system. Returns true on the first call.
    pub(crate) fn mark_system(&self) -> bool {
        !self.is_system.swap(true, Ordering::AcqRel)
    }

    // --- cancellation ---

    pub(crate) fn cancel_points(&self) -> u32 {
        self.cancel_points.load(Ordering::Relaxed)
    }

    /// Request cancellation. Atomically transitions the state machine, then
    /// makes the task ready so it observes the cancel at its next
    /// cancellation point. A task still `fresh` collapses straight to
    /// `finished`: the body never runs.
    ///
    /// Returns false if the task was already canceled or finished.
    pub(crate) fn cancel(self: &Arc<Self>) -> bool {
        match self.transition(State::Canceled) {
            Some(State::Finished) => {
                // Collapsed before start. The spawn already queued it; the
                // owner loop reaps it without ever swapping in.
                trace!(task = %self.id, "canceled before start");
                self.set_outcome(Outcome::Canceled);
                true
            }
            Some(_) => {
                trace!(task = %self.id, "canceling");
                self.make_ready_on_owner();
                true
            }
            None => false,
        }
    }

    /// Hand this task to whichever scheduler currently owns it.
    pub(crate) fn make_ready_on_owner(self: &Arc<Self>) {
        let owner = self.owner.lock().clone();
        owner.ready(self.clone());
    }

    pub(crate) fn owner(&self) -> Handle {
        self.owner.lock().clone()
    }

    pub(crate) fn set_owner(&self, owner: Handle) {
        *self.owner.lock() = owner;
    }

    // --- timers ---

    pub(crate) fn arm_timer(&self, when: Instant, interrupt: Option<Interrupt>) -> TimerId {
        self.timers.lock().insert(when, interrupt)
    }

    pub(crate) fn disarm_timer(&self, id: TimerId) {
        self.timers.lock().remove(id);
    }

    pub(crate) fn pop_due_timer(&self, now: Instant) -> Option<timer::TimerEntry> {
        self.timers.lock().pop_due(now)
    }

    pub(crate) fn earliest_timer(&self) -> Option<Instant> {
        self.timers.lock().earliest()
    }

    pub(crate) fn timer_when(&self, id: TimerId) -> Option<Instant> {
        self.timers.lock().when_of(id)
    }

    pub(crate) fn has_timers(&self) -> bool {
        !self.timers.lock().is_empty()
    }

    // --- pending interrupt ---

    pub(crate) fn set_pending_if_none(&self, interrupt: Interrupt) {
        let mut pending = self.pending.lock();
        if pending.is_none() {
            *pending = Some(interrupt);
        }
    }

    pub(crate) fn take_pending(&self) -> Option<Interrupt> {
        self.pending.lock().take()
    }

    /// Drop a stored interrupt of the given kind, e.g. a deadline that fired
    /// but whose scope was exited before the next cancellation point.
    pub(crate) fn clear_pending(&self, interrupt: Interrupt) {
        let mut pending = self.pending.lock();
        if *pending == Some(interrupt) {
            *pending = None;
        }
    }

    // --- io wake note ---

    pub(crate) fn set_io_ready(&self) {
        self.io_ready.store(true, Ordering::Release);
    }

    pub(crate) fn take_io_ready(&self) -> bool {
        self.io_ready.swap(false, Ordering::AcqRel)
    }

    // --- labels ---

    pub(crate) fn name(&self) -> String {
        self.labels.lock().name.clone()
    }

    pub(crate) fn set_name(&self, name: impl Into<String>) {
        self.labels.lock().name = name.into();
    }

    pub(crate) fn status(&self) -> String {
        self.labels.lock().status.clone()
    }

    pub(crate) fn set_status(&self, status: impl Into<String>) {
        self.labels.lock().status = status.into();
    }

    /// One line for the diagnostic dump.
    pub(crate) fn describe(&self) -> String {
        let labels = self.labels.lock();
        format!(
            "task[{},{}] name={:?} status={:?} system={}",
            self.id,
            self.state(),
            labels.name,
            labels.status,
            self.is_system(),
        )
    }

    // --- join support ---

    pub(crate) fn add_joiner(&self, joiner: TaskRef) {
        let mut joiners = self.joiners.lock();
        if !joiners.iter().any(|j| j.id() == joiner.id()) {
            joiners.push(joiner);
        }
    }

    pub(crate) fn remove_joiner(&self, id: Id) {
        self.joiners.lock().retain(|j| j.id() != id);
    }

    pub(crate) fn take_joiners(&self) -> Vec<TaskRef> {
        std::mem::take(&mut self.joiners.lock())
    }

    pub(crate) fn set_outcome(&self, outcome: Outcome) {
        let val = match outcome {
            Outcome::Completed => OUTCOME_COMPLETED,
            Outcome::Canceled => OUTCOME_CANCELED,
        };
        // First writer wins; the fresh-collapse path and the trampoline
        // cannot both run, but a late cancel may race the normal finish.
        let _ = self.outcome.compare_exchange(
            OUTCOME_UNSET,
            val,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn outcome(&self) -> Option<Outcome> {
        match self.outcome.load(Ordering::Acquire) {
            OUTCOME_COMPLETED => Some(Outcome::Completed),
            OUTCOME_CANCELED => Some(Outcome::Canceled),
            _ => None,
        }
    }

    // --- migration ---

    pub(crate) fn request_migrate(&self, target: Handle) {
        *self.migrate_to.lock() = Some(target);
    }

    pub(crate) fn take_migrate_request(&self) -> Option<Handle> {
        self.migrate_to.lock().take()
    }

    // --- owner-thread-only accessors ---

    pub(crate) fn entry_body(&self) -> Option<TaskBody> {
        self.entry.lock().take()
    }

    pub(crate) fn cpu_ptr(&self) -> *mut CpuContext {
        self.cpu.get()
    }

    /// Reclaim the stack of a finished task.
    ///
    /// # Safety
    ///
    /// The task must be `finished` and off its stack for good (i.e. the
    /// caller is the owner loop, after the final swap away from the task).
    pub(crate) unsafe fn take_stack(&self) -> Option<Stack> {
        unsafe { (*self.stack.get()).take() }
    }
}

/// Scope marker for a cancellation point. While at least one of these is
/// alive on a task's stack, a pending cancel is delivered by unwinding.
pub(crate) struct CancellationPoint<'a> {
    task: &'a Task,
}

impl<'a> CancellationPoint<'a> {
    pub(crate) fn enter(task: &'a Task) -> Self {
        task.cancel_points.fetch_add(1, Ordering::Relaxed);
        CancellationPoint { task }
    }
}

impl Drop for CancellationPoint<'_> {
    fn drop(&mut self) {
        self.task.cancel_points.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Claim on a spawned task's terminal outcome.
///
/// Dropping the handle detaches it; the task keeps running.
#[derive(Debug, Clone)]
pub struct JoinHandle {
    task: TaskRef,
}

impl JoinHandle {
    pub(crate) fn new(task: TaskRef) -> Self {
        JoinHandle { task }
    }

    pub fn id(&self) -> Id {
        self.task.id()
    }

    pub fn is_finished(&self) -> bool {
        self.task.outcome().is_some()
    }

    /// Request cancellation of the task. Returns false if it already
    /// finished or was already canceled.
    pub fn cancel(&self) -> bool {
        self.task.cancel()
    }

    /// Block the calling task until the target is `finished`, and report the
    /// terminal outcome. This is a cancellation point.
    ///
    /// # Panics
    ///
    /// Panics when called from outside a task, or on self-join.
    #[track_caller]
    pub fn join(self) -> Outcome {
        let current = context::current_task().expect("JoinHandle::join called outside of a task");
        assert!(
            current.id() != self.task.id(),
            "FATAL: task cannot join itself"
        );

        loop {
            if let Some(outcome) = self.task.outcome() {
                return outcome;
            }

            // Register first, then re-check: the target may finish between
            // the check above and the park below, and its finish path only
            // wakes joiners it can see.
            self.task.add_joiner(current.clone());
            if let Some(outcome) = self.task.outcome() {
                self.task.remove_joiner(current.id());
                return outcome;
            }

            let current_id = current.id();
            let mut cleanup = ScopeGuard::new(|| self.task.remove_joiner(current_id));

            let _ = current.transition(State::Asleep);
            context::with_scheduler(|s| s.suspend());

            cleanup.disarm();
            self.task.remove_joiner(current.id());
        }
    }
}
