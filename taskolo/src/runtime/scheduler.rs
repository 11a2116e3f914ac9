//! The per-thread scheduler: ready queue, cross-thread wake queue, timer
//! index, io driver, and the event loop that multiplexes tasks onto this
//! thread's main context.

use crate::context;
use crate::error::{Interrupt, Result as IoResult, is_interrupt_payload};
use crate::io::{Driver, Interest, wake_by_pipe};
use crate::runtime::RuntimeConfig;
use crate::runtime::registry;
use crate::task::cpu::{CpuContext, cpu_switch};
use crate::task::stack::StackPool;
use crate::task::timer::TimerIndex;
use crate::task::{CancellationPoint, Id, Outcome, SchedulerId, State, Task, TaskBody, TaskRef};
use anyhow::Result;
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::{HashMap, VecDeque};
use std::os::fd::{OwnedFd, RawFd};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, error, trace};

/// Wakeup-protocol flags. Exactly one of the two may be set while the loop
/// blocks: `asleep` for the condvar path, `polling` for the io path.
#[derive(Debug, Default)]
struct ParkFlags {
    asleep: bool,
    polling: bool,
}

/// Cross-thread face of a scheduler. Everything here may be touched from any
/// thread; the single-threaded state lives in [`Scheduler`].
#[derive(Debug)]
pub(crate) struct Shared {
    id: SchedulerId,

    /// Tasks made ready by other threads, drained by the owner loop.
    wake_q: SegQueue<TaskRef>,

    parker: Mutex<ParkFlags>,
    unparker: Condvar,

    /// Write end of the owner's self-pipe, for breaking an io wait.
    wake_tx: OwnedFd,

    /// Live non-system tasks. The loop exits when this reaches zero.
    user_tasks: AtomicUsize,

    /// Shutdown fan-out flag; the owner loop cancels everything once set.
    shutdown: AtomicBool,

    /// Diagnostic dump request, served by the owner loop.
    dump: AtomicBool,

    /// Set when the owner loop exits; a closed scheduler accepts no more
    /// migration handoffs.
    closed: AtomicBool,
}

#[derive(Debug, Clone)]
pub(crate) struct Handle(Arc<Shared>);

impl Handle {
    pub(crate) fn id(&self) -> SchedulerId {
        self.0.id
    }

    pub(crate) fn user_count(&self) -> usize {
        self.0.user_tasks.load(Ordering::Acquire)
    }

    pub(crate) fn inc_user(&self) {
        self.0.user_tasks.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_user(&self) {
        self.0.user_tasks.fetch_sub(1, Ordering::AcqRel);
    }

    /// Make `task` ready on this scheduler.
    ///
    /// From the owner thread this is a direct queue push. From any other
    /// thread the task goes through the wake queue and the wakeup protocol:
    /// push, then under the parker lock signal the condvar (asleep) or write
    /// one byte into the self-pipe (polling).
    pub(crate) fn ready(&self, task: TaskRef) {
        if context::current_scheduler_id() == Some(self.id()) {
            context::with_scheduler(|s| s.make_ready(task));
            return;
        }

        // Wakes of an already-queued task coalesce on the claim.
        if task.claim_ready() {
            trace!(task = %task.id(), scheduler = %self.id(), "remote ready");
            self.0.wake_q.push(task);
            self.wake();
        }
    }

    /// Push without claiming; used for migration handoff where the claim
    /// travels with the task.
    pub(crate) fn push_wake(&self, task: TaskRef) {
        self.0.wake_q.push(task);
    }

    /// Break the owner loop out of its blocking wait, if any.
    pub(crate) fn wake(&self) {
        let mut park = self.0.parker.lock();
        if park.asleep {
            park.asleep = false;
            self.0.unparker.notify_one();
        } else if park.polling {
            park.polling = false;
            wake_by_pipe(&self.0.wake_tx);
        }
    }

    pub(crate) fn request_shutdown(&self) {
        self.0.shutdown.store(true, Ordering::Release);
        self.wake();
    }

    pub(crate) fn request_dump(&self) {
        self.0.dump.store(true, Ordering::Release);
        self.wake();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub(crate) struct Scheduler {
    cfg: RuntimeConfig,

    shared: Handle,

    /// FIFO of runnable tasks.
    ready_q: RefCell<VecDeque<TaskRef>>,

    /// All tasks known to this scheduler.
    all_tasks: RefCell<HashMap<Id, TaskRef>>,

    /// Finished tasks whose stacks are reclaimed at the next safe point; a
    /// task must not free the stack it is still running on.
    gc_tasks: RefCell<Vec<TaskRef>>,

    /// Tasks with pending timers, ordered by earliest deadline.
    timer_index: RefCell<TimerIndex>,

    io: RefCell<Driver>,

    stack_pool: RefCell<StackPool>,

    /// The task currently being run, if any.
    current: RefCell<Option<TaskRef>>,

    /// This thread's own context; never active at the same time as a task.
    main_cpu: UnsafeCell<CpuContext>,

    /// Monotonic time refreshed once per loop iteration.
    cached_now: Cell<Instant>,

    /// Total swaps into tasks; `yield` reports its progress from this.
    nswitch: Cell<u64>,

    shutdown_started: Cell<bool>,
    draining_system_tasks: Cell<bool>,
}

impl Scheduler {
    pub(crate) fn try_new(cfg: RuntimeConfig) -> Result<Self> {
        crate::error::install_quiet_interrupt_hook();
        crate::signal::init();

        let (driver, wake_tx) = Driver::new()?;

        let shared = Handle(Arc::new(Shared {
            id: SchedulerId::next(),
            wake_q: SegQueue::new(),
            parker: Mutex::new(ParkFlags::default()),
            unparker: Condvar::new(),
            wake_tx,
            user_tasks: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            dump: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }));

        Ok(Scheduler {
            cfg,
            shared,
            ready_q: RefCell::new(VecDeque::new()),
            all_tasks: RefCell::new(HashMap::new()),
            gc_tasks: RefCell::new(Vec::new()),
            timer_index: RefCell::new(TimerIndex::default()),
            io: RefCell::new(driver),
            stack_pool: RefCell::new(StackPool::default()),
            current: RefCell::new(None),
            main_cpu: UnsafeCell::new(CpuContext::new()),
            cached_now: Cell::new(Instant::now()),
            nswitch: Cell::new(0),
            shutdown_started: Cell::new(false),
            draining_system_tasks: Cell::new(false),
        })
    }

    pub(crate) fn id(&self) -> SchedulerId {
        self.shared.id()
    }

    pub(crate) fn handle(&self) -> Handle {
        self.shared.clone()
    }

    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.cfg
    }

    pub(crate) fn current_task(&self) -> Option<TaskRef> {
        self.current.borrow().clone()
    }

    /// Cached monotonic time, refreshed each loop iteration. Close enough
    /// for sleeps and deadlines, and cheap for hot paths.
    pub(crate) fn now(&self) -> Instant {
        self.cached_now.get()
    }

    pub(crate) fn nswitch(&self) -> u64 {
        self.nswitch.get()
    }

    fn main_cpu_ptr(&self) -> *mut CpuContext {
        self.main_cpu.get()
    }

    // --- spawning ---

    /// Create a task and place it, still `fresh`, at the back of the ready
    /// queue. The trampoline performs the `fresh -> ready` transition on
    /// first swap-in.
    pub(crate) fn spawn(&self, body: TaskBody, system: bool) -> TaskRef {
        let stack = self
            .stack_pool
            .borrow_mut()
            .take(self.cfg.stack_size)
            .unwrap_or_else(|e| panic!("FATAL: failed to allocate a task stack: {e:?}"));

        let task = Task::new(body, stack, self.handle(), task_trampoline);
        if system {
            task.mark_system();
        } else {
            self.shared.inc_user();
        }

        debug!(task = %task.id(), scheduler = %self.id(), "spawned");

        self.all_tasks.borrow_mut().insert(task.id(), task.clone());
        registry::register_task(&task);

        let claimed = task.claim_ready();
        debug_assert!(claimed, "fresh task already in a queue");
        self.ready_q.borrow_mut().push_back(task.clone());

        task
    }

    // --- readying ---

    /// Owner-thread path of the ready protocol.
    pub(crate) fn make_ready(&self, task: TaskRef) {
        if task.state() == State::Finished {
            return;
        }
        if task.claim_ready() {
            trace!(task = %task.id(), "readying");
            let _ = task.transition(State::Ready);
            self.ready_q.borrow_mut().push_back(task);
        }
    }

    /// Enqueue a task whose ready claim was taken by a remote waker, or that
    /// arrived via migration handoff.
    fn enqueue_claimed(&self, task: TaskRef) {
        if task.owner().id() != self.id() {
            // Raced with a migration; hand it to the real owner.
            let owner = task.owner();
            owner.push_wake(task);
            owner.wake();
            return;
        }

        self.adopt_if_new(&task);
        let _ = task.transition(State::Ready);
        self.ready_q.borrow_mut().push_back(task);
    }

    /// First contact with a migrated task: take it into `all_tasks` and
    /// re-index any timers it carried along.
    fn adopt_if_new(&self, task: &TaskRef) {
        let mut all = self.all_tasks.borrow_mut();
        if all.insert(task.id(), task.clone()).is_none() {
            drop(all);
            debug!(task = %task.id(), scheduler = %self.id(), "adopted");
            if task.has_timers() {
                self.timer_index.borrow_mut().resync(task);
            }
        }
    }

    pub(crate) fn resync_timers(&self, task: &TaskRef) {
        self.timer_index.borrow_mut().resync(task);
    }

    /// Flag the current task system; it stops counting toward the user-task
    /// population that keeps this scheduler alive.
    pub(crate) fn make_current_system(&self) {
        let task = self
            .current_task()
            .expect("make_system called outside of a task");
        if task.mark_system() {
            self.shared.dec_user();
        }
    }

    // --- io plumbing for fd_wait ---

    pub(crate) fn io_register(&self, fd: RawFd, interest: Interest, task: &TaskRef) -> IoResult<()> {
        self.io.borrow_mut().register(fd, interest, task)
    }

    pub(crate) fn io_deregister(&self, fd: RawFd, interest: Interest, task_id: Id) {
        self.io.borrow_mut().deregister(fd, interest, task_id);
    }

    // --- the loop ---

    /// Run until the non-system task population reaches zero and the
    /// remaining system tasks have drained.
    pub(crate) fn run(&self) {
        loop {
            self.check_shutdown();
            self.check_dump();
            self.drain_wake_q();
            self.cached_now.set(Instant::now());
            self.fire_due_timers();

            if self.ready_q.borrow().is_empty() {
                if self.finished_draining() {
                    break;
                }
                self.park();
                continue;
            }

            let task = {
                let mut ready_q = self.ready_q.borrow_mut();
                ready_q.pop_front().expect("checked non-empty")
            };

            if task.owner().id() != self.id() {
                // Migration raced a wake; forward without clearing the claim.
                let owner = task.owner();
                owner.push_wake(task);
                owner.wake();
                continue;
            }

            task.clear_ready();

            if task.state() == State::Finished {
                // Canceled while still fresh: reap, never swap in.
                self.retire(&task);
                self.collect_garbage();
                continue;
            }

            // A task readied before it finished suspending is popped while
            // still `asleep`; normalize. `fresh` is left for the trampoline.
            if task.state() == State::Asleep {
                let _ = task.transition(State::Ready);
            }

            *self.current.borrow_mut() = Some(task.clone());
            self.nswitch.set(self.nswitch.get() + 1);
            trace!(task = %task.id(), "swapping in");

            // Safety: we are on the main context and the task's stack is
            // alive; the swap returns when the task suspends or finishes.
            unsafe { cpu_switch(self.main_cpu_ptr(), task.cpu_ptr()) };

            *self.current.borrow_mut() = None;
            self.collect_garbage();
            self.handle_migration(&task);
        }

        self.drain_on_exit();
        debug!(scheduler = %self.id(), "scheduler drained");
    }

    /// Last-chance handling of wake-queue entries that raced our exit:
    /// migration handoffs are passed on to a live scheduler, or canceled
    /// outright when none exists, so joiners never hang on a dead queue.
    fn drain_on_exit(&self) {
        self.shared.0.closed.store(true, Ordering::Release);

        while let Some(task) = self.shared.0.wake_q.pop() {
            let owner = task.owner();
            if owner.id() != self.id() {
                owner.push_wake(task);
                owner.wake();
                continue;
            }

            match registry::pick_other(self.id()) {
                Some(other) if !other.is_closed() => {
                    if !task.is_system() {
                        self.shared.dec_user();
                        other.inc_user();
                    }
                    task.set_owner(other.clone());
                    other.push_wake(task);
                    other.wake();
                }
                _ => {
                    // Nowhere left to run it; give joiners a terminal state.
                    task.set_outcome(Outcome::Canceled);
                    let _ = task.transition(State::Canceled);
                    let _ = task.transition(State::Finished);
                    registry::deregister_task(task.id());
                    if !task.is_system() {
                        self.shared.dec_user();
                    }
                    for joiner in task.take_joiners() {
                        joiner.make_ready_on_owner();
                    }
                }
            }
        }
    }

    /// Zero user tasks means the scheduler is done; any remaining system
    /// tasks are canceled once and drained before the loop exits.
    fn finished_draining(&self) -> bool {
        if self.shared.user_count() > 0 {
            return false;
        }

        let remaining: Vec<TaskRef> = self.all_tasks.borrow().values().cloned().collect();
        if remaining.is_empty() {
            return self.shared.0.wake_q.is_empty();
        }

        if !self.draining_system_tasks.replace(true) {
            debug!(
                scheduler = %self.id(),
                count = remaining.len(),
                "canceling remaining system tasks"
            );
            for task in remaining {
                task.cancel();
            }
        }
        false
    }

    fn check_shutdown(&self) {
        if self.shared.0.shutdown.load(Ordering::Acquire) && !self.shutdown_started.replace(true) {
            let all: Vec<TaskRef> = self.all_tasks.borrow().values().cloned().collect();
            debug!(scheduler = %self.id(), count = all.len(), "shutdown: canceling all tasks");
            for task in all {
                task.cancel();
            }
        }
    }

    /// Serve a dump request. Both the programmatic `runtime::dump()` and the
    /// signal watcher arrive here via `Handle::request_dump`, which also
    /// woke us if we were parked.
    fn check_dump(&self) {
        if self.shared.0.dump.swap(false, Ordering::AcqRel) {
            self.dump();
        }
    }

    /// Print every live task on this scheduler to stderr.
    pub(crate) fn dump(&self) {
        let mut tasks: Vec<TaskRef> = self.all_tasks.borrow().values().cloned().collect();
        tasks.sort_by_key(|t| t.id());

        eprintln!("scheduler[{}]: {} tasks", self.id(), tasks.len());
        for task in tasks {
            eprintln!("  {}", task.describe());
        }
    }

    fn drain_wake_q(&self) {
        while let Some(task) = self.shared.0.wake_q.pop() {
            trace!(task = %task.id(), "drained from wake queue");
            self.enqueue_claimed(task);
        }
    }

    fn fire_due_timers(&self) {
        let now = self.cached_now.get();
        let due = self.timer_index.borrow_mut().take_due(now);

        for task in due {
            while let Some(entry) = task.pop_due_timer(now) {
                if let Some(interrupt) = entry.interrupt {
                    task.set_pending_if_none(interrupt);
                }
            }
            self.timer_index.borrow_mut().resync(&task);
            trace!(task = %task.id(), "timer fired");
            self.make_ready(task);
        }
    }

    /// Block until something to do arrives. The bound is the earliest timer
    /// across all tasks; the wait itself is the condvar when no fd is being
    /// watched, the io driver otherwise.
    fn park(&self) {
        let bound = self.timer_index.borrow().next_when();
        let has_io = self.io.borrow().has_waiters();

        let mut park = self.shared.0.parker.lock();
        // A remote waker may have pushed between our drain and this lock.
        if !self.shared.0.wake_q.is_empty() {
            return;
        }

        if has_io {
            park.polling = true;
            drop(park);

            let timeout = bound.map(|when| when.saturating_duration_since(Instant::now()));
            let woken = self.io.borrow_mut().poll(timeout);

            self.shared.0.parker.lock().polling = false;

            match woken {
                Ok(tasks) => {
                    for task in tasks {
                        self.make_ready(task);
                    }
                }
                Err(e) => panic!("FATAL: scheduler io driver failure: {e}"),
            }
        } else {
            park.asleep = true;
            match bound {
                Some(when) => {
                    let _ = self.shared.0.unparker.wait_until(&mut park, when);
                }
                None => self.shared.0.unparker.wait(&mut park),
            }
            park.asleep = false;
        }
    }

    // --- task retirement ---

    /// Remove a finished task from this scheduler. Idempotent; the stack is
    /// reclaimed later by `collect_garbage`.
    pub(crate) fn retire(&self, task: &TaskRef) {
        if self.all_tasks.borrow_mut().remove(&task.id()).is_none() {
            return;
        }
        self.timer_index.borrow_mut().remove(task.id());
        if !task.is_system() {
            self.shared.dec_user();
        }
        registry::deregister_task(task.id());

        debug!(task = %task.id(), "finished");
        for joiner in task.take_joiners() {
            joiner.make_ready_on_owner();
        }

        self.gc_tasks.borrow_mut().push(task.clone());
    }

    fn collect_garbage(&self) {
        let mut gc = self.gc_tasks.borrow_mut();
        for task in gc.drain(..) {
            // Safety: the task is finished and swapped away for good; nobody
            // can run on this stack anymore.
            if let Some(stack) = unsafe { task.take_stack() } {
                self.stack_pool.borrow_mut().put(stack);
            }
        }
    }

    /// Honor a migrate request once the task is fully off its stack.
    fn handle_migration(&self, task: &TaskRef) {
        let Some(target) = task.take_migrate_request() else {
            return;
        };

        if target.is_closed() {
            // The target drained while this task was suspending; stay home.
            self.make_ready(task.clone());
            return;
        }

        debug!(task = %task.id(), from = %self.id(), to = %target.id(), "migrating");

        self.all_tasks.borrow_mut().remove(&task.id());
        self.timer_index.borrow_mut().remove(task.id());
        if !task.is_system() {
            self.shared.dec_user();
            target.inc_user();
        }
        task.set_owner(target.clone());

        if task.claim_ready() {
            target.push_wake(task.clone());
            target.wake();
        }
        // If the claim was already taken, a racing waker queued the task;
        // the ownership checks forward it to the target.
    }

    // --- suspension (runs on task stacks) ---

    /// Deliver whatever accumulated while the task was suspended, in order:
    /// a pending cancel (if inside a cancellation point), due timers, then a
    /// stored interrupt. Runs on the task's own stack so a throw unwinds it.
    fn post_swap(&self, task: &TaskRef) {
        if task.state() == State::Canceled
            && task.cancel_points() > 0
            && task.transition(State::Unwinding).is_some()
        {
            trace!(task = %task.id(), "unwinding");
            Interrupt::Interrupted.throw();
        }

        let now = self.cached_now.get();
        while let Some(entry) = task.pop_due_timer(now) {
            self.resync_timers(task);
            if let Some(interrupt) = entry.interrupt {
                interrupt.throw();
            }
        }

        if let Some(interrupt) = task.take_pending() {
            interrupt.throw();
        }
    }

    /// Swap from the current task back to the scheduler. Returns when the
    /// loop swaps this task in again; this is a cancellation point.
    pub(crate) fn suspend(&self) {
        suspend_current();
    }
}

/// The body of every suspension: swap to the main context and, once
/// resumed, run the post-swap checks on whichever scheduler now hosts the
/// task (migration may have changed it).
///
/// Careful not to hold an `Rc` across the switch: a migrated task resumes
/// on another thread, and dropping an `Rc` clone there would corrupt its
/// refcount. Everything captured across the swap is `Arc` or raw.
pub(crate) fn suspend_current() {
    let (task, main_cpu) = {
        let s = context::scheduler();
        let task = s
            .current_task()
            .expect("FATAL: suspend called outside of a task");
        (task, s.main_cpu_ptr())
    };

    let _point = CancellationPoint::enter(&task);

    // Safety: both contexts are valid; the loop saved the main context when
    // it swapped us in.
    unsafe { cpu_switch(task.cpu_ptr(), main_cpu) };

    // Possibly a different thread now; re-resolve the host.
    let host = context::scheduler();
    host.post_swap(&task);
}

/// First (and only) frame of every task stack.
///
/// Runs the body, swallows a cancellation unwind, treats any other panic as
/// fatal to the process, then retires the task and swaps home for good.
extern "C" fn task_trampoline() -> ! {
    // No Rc may be held across the body: it can migrate the task to another
    // thread. Resolve through the thread-local each time instead.
    let task = context::current_task().expect("FATAL: trampoline without a current task");

    // fresh -> ready; a cancel that landed first collapsed the state to
    // finished and the body must never run.
    if task.transition(State::Ready) == Some(State::Ready) {
        if let Some(body) = task.entry_body() {
            match catch_unwind(AssertUnwindSafe(body)) {
                Ok(()) => task.set_outcome(Outcome::Completed),
                Err(payload) if is_interrupt_payload(payload.as_ref()) => {
                    // Cancellation unwound the stack; destructors have run.
                    task.set_outcome(Outcome::Canceled);
                }
                Err(payload) => {
                    // The contract: tasks handle their own errors.
                    let msg = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "<non-string panic payload>".to_string());
                    error!("FATAL: unhandled panic in {}: {}", task.describe(), msg);
                    eprintln!("FATAL: unhandled panic in {}: {}", task.describe(), msg);
                    std::process::abort();
                }
            }
        }
    } else {
        task.set_outcome(Outcome::Canceled);
    }

    let _ = task.transition(State::Finished);

    let (task_cpu, main_cpu) = {
        let scheduler = context::scheduler();
        scheduler.retire(&task);
        (task.cpu_ptr(), scheduler.main_cpu_ptr())
    };

    // The final swap must not leak anything on this stack: drop every owned
    // value first. The scheduler keeps the task (and this stack) alive in
    // its garbage list until after the swap.
    drop(task);

    // Safety: contexts valid as above; the stack stays alive through the
    // scheduler's gc list until after the loop regains control.
    unsafe { cpu_switch(task_cpu, main_cpu) };

    error!("FATAL: fell through the trampoline");
    std::process::abort();
}
