use crate as taskolo;
use crate::context;
use crate::io::Interest;
use crate::runtime::Builder;
use crate::runtime::scheduler::Handle;
use crate::sync::{Deadline, Qutex, Rendez};
use crate::task::{JoinHandle, Outcome};
use anyhow::Result;
use parking_lot::Mutex;
use static_assertions::assert_impl_all;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

assert_impl_all!(Handle: Send, Sync);
assert_impl_all!(JoinHandle: Send);
assert_impl_all!(Qutex: Send, Sync);
assert_impl_all!(Rendez: Send, Sync);

/// Sets a flag when dropped; proves destructors ran on the cancel unwind.
struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[taskolo::test]
fn test_yield_fifo_fairness() {
    // Two tasks alternate writes in strict FIFO order within one scheduler.
    let seq: Arc<Mutex<Vec<&str>>> = Arc::new(Mutex::new(Vec::new()));

    let spawn_writer = |tag: &'static str| {
        let seq = seq.clone();
        taskolo::spawn(move || {
            for _ in 0..3 {
                seq.lock().push(tag);
                taskolo::this_task::yield_now();
            }
            seq.lock().push(tag);
        })
    };

    let a = spawn_writer("a");
    let b = spawn_writer("b");

    assert_eq!(a.join(), Outcome::Completed);
    assert_eq!(b.join(), Outcome::Completed);

    let seq = seq.lock();
    assert_eq!(*seq, ["a", "b", "a", "b", "a", "b", "a", "b"]);
}

#[taskolo::test]
fn test_cancel_wakes_sleeper_promptly() {
    let cleaned = Arc::new(AtomicBool::new(false));
    let cleaned_in_task = cleaned.clone();

    let sleeper = taskolo::spawn(move || {
        let _cleanup = SetOnDrop(cleaned_in_task);
        taskolo::this_task::sleep_for(Duration::from_millis(500));
    });

    taskolo::this_task::sleep_for(Duration::from_millis(10));

    let start = Instant::now();
    assert!(sleeper.cancel());
    assert_eq!(sleeper.join(), Outcome::Canceled);

    // The cancel interrupts the sleep immediately; nobody waits out 500ms.
    assert!(start.elapsed() < Duration::from_millis(50));
    assert!(cleaned.load(Ordering::SeqCst), "destructors must run on cancel");
}

#[taskolo::test]
fn test_cancel_fresh_task_never_runs_body() {
    let ran = Arc::new(AtomicBool::new(false));
    let ran_in_task = ran.clone();

    // No suspension between spawn and cancel: the task is still fresh.
    let task = taskolo::spawn(move || {
        ran_in_task.store(true, Ordering::SeqCst);
    });

    assert!(task.cancel());
    assert!(!task.cancel(), "second cancel is a no-op");

    assert_eq!(task.join(), Outcome::Canceled);
    assert!(!ran.load(Ordering::SeqCst));
}

#[taskolo::test]
fn test_interrupt_delivered_exactly_once() {
    let caught = Arc::new(AtomicU32::new(0));
    let caught_in_task = caught.clone();

    let task = taskolo::spawn(move || {
        let result = catch_unwind(AssertUnwindSafe(|| {
            taskolo::this_task::sleep_for(Duration::from_secs(10));
        }));
        if let Err(payload) = result {
            assert!(payload.is::<taskolo::TaskInterrupted>());
            caught_in_task.fetch_add(1, Ordering::SeqCst);
        }
        // Further cancellation points must not re-throw.
        taskolo::this_task::yield_now();
        taskolo::this_task::yield_now();
    });

    taskolo::this_task::sleep_for(Duration::from_millis(10));
    assert!(task.cancel());

    // The body caught the interrupt and completed on its own terms.
    assert_eq!(task.join(), Outcome::Completed);
    assert_eq!(caught.load(Ordering::SeqCst), 1);
}

#[taskolo::test]
fn test_qutex_timed_lock_then_fifo_handoff() {
    let qutex = Arc::new(Qutex::new());
    let order: Arc<Mutex<Vec<&str>>> = Arc::new(Mutex::new(Vec::new()));

    let q = qutex.clone();
    let o = order.clone();
    let a = taskolo::spawn(move || {
        let guard = q.lock();
        o.lock().push("A");
        taskolo::this_task::sleep_for(Duration::from_millis(100));
        drop(guard);
    });

    // Let A take the qutex.
    taskolo::this_task::yield_now();

    let q = qutex.clone();
    let b = taskolo::spawn(move || {
        let start = Instant::now();
        assert!(q.try_lock_for(Duration::from_millis(30)).is_none());

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(25), "gave up too early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(95), "gave up too late: {elapsed:?}");
    });

    let q = qutex.clone();
    let o = order.clone();
    let c = taskolo::spawn(move || {
        let _guard = q.lock();
        o.lock().push("C");
    });

    assert_eq!(b.join(), Outcome::Completed);
    assert_eq!(c.join(), Outcome::Completed);
    assert_eq!(a.join(), Outcome::Completed);

    // B timed out and never acquired; C acquired after A unlocked.
    assert_eq!(*order.lock(), ["A", "C"]);
}

#[taskolo::test]
fn test_qutex_waiters_acquire_in_fifo_order() {
    let qutex = Arc::new(Qutex::new());
    let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    let held = qutex.lock();

    let contenders: Vec<JoinHandle> = (1..=3)
        .map(|n| {
            let q = qutex.clone();
            let o = order.clone();
            taskolo::spawn(move || {
                let _guard = q.lock();
                o.lock().push(n);
            })
        })
        .collect();

    // Let all three queue up behind us, then hand off.
    taskolo::this_task::sleep_for(Duration::from_millis(10));
    drop(held);

    for contender in contenders {
        assert_eq!(contender.join(), Outcome::Completed);
    }
    assert_eq!(*order.lock(), [1, 2, 3]);
}

#[taskolo::test]
fn test_canceled_waiter_leaves_qutex_queue() {
    let qutex = Arc::new(Qutex::new());

    let held = qutex.lock();

    let q = qutex.clone();
    let waiter = taskolo::spawn(move || {
        let _guard = q.lock();
    });

    let q = qutex.clone();
    let successor = taskolo::spawn(move || {
        let _guard = q.lock();
    });

    // Both are queued; cancel the head waiter, then unlock. Ownership must
    // skip the canceled task and reach the successor.
    taskolo::this_task::sleep_for(Duration::from_millis(10));
    assert!(waiter.cancel());
    assert_eq!(waiter.join(), Outcome::Canceled);

    drop(held);
    assert_eq!(successor.join(), Outcome::Completed);
}

#[taskolo::test]
fn test_deadline_interrupts_sleep() {
    let start = Instant::now();

    let result = Deadline::timed(Duration::from_millis(5), || {
        taskolo::this_task::sleep_for(Duration::from_millis(100));
    });

    let elapsed = start.elapsed();
    assert!(result.is_err(), "deadline must fire inside the long sleep");
    assert!(elapsed >= Duration::from_millis(4));
    assert!(elapsed < Duration::from_millis(90), "sleep was not interrupted: {elapsed:?}");
}

#[taskolo::test]
fn test_deadline_left_in_time_never_fires() {
    let result = Deadline::timed(Duration::from_millis(50), || {
        taskolo::this_task::sleep_for(Duration::from_millis(5));
        42
    });
    assert_eq!(result, Ok(42));

    // Long past the (disarmed) deadline: nothing fires.
    taskolo::this_task::sleep_for(Duration::from_millis(60));
}

#[taskolo::test]
fn test_deadline_zero_fires_at_next_cancellation_point() {
    let result = Deadline::timed(Duration::ZERO, || {
        taskolo::this_task::yield_now();
    });
    assert!(result.is_err());
}

#[taskolo::test]
fn test_deadline_remaining_counts_down() {
    let deadline = Deadline::new(Duration::from_millis(100));
    assert!(deadline.remaining() <= Duration::from_millis(100));

    taskolo::this_task::sleep_for(Duration::from_millis(20));
    let remaining = deadline.remaining();
    assert!(remaining < Duration::from_millis(100));

    let mut deadline = deadline;
    deadline.cancel();
    assert_eq!(deadline.remaining(), Duration::ZERO);
}

#[taskolo::test]
fn test_rendez_sleep_wakeup_ordering() {
    let qutex = Arc::new(Qutex::new());
    let rendez = Arc::new(Rendez::new());
    let events: Arc<Mutex<Vec<&str>>> = Arc::new(Mutex::new(Vec::new()));

    let q = qutex.clone();
    let r = rendez.clone();
    let e = events.clone();
    let waiter = taskolo::spawn(move || {
        let mut guard = q.lock();
        e.lock().push("A-wait");
        r.sleep(&mut guard);
        // Resumes holding the qutex again.
        e.lock().push("A-resume");
    });

    // Let A park in the rendez first.
    taskolo::this_task::sleep_for(Duration::from_millis(10));

    {
        let _guard = qutex.lock();
        events.lock().push("B-signal");
        rendez.wakeup();
    }

    assert_eq!(waiter.join(), Outcome::Completed);
    assert_eq!(*events.lock(), ["A-wait", "B-signal", "A-resume"]);
}

#[taskolo::test]
fn test_rendez_wakeup_all() {
    let qutex = Arc::new(Qutex::new());
    let rendez = Arc::new(Rendez::new());
    let resumed = Arc::new(AtomicU32::new(0));

    let waiters: Vec<JoinHandle> = (0..3)
        .map(|_| {
            let q = qutex.clone();
            let r = rendez.clone();
            let n = resumed.clone();
            taskolo::spawn(move || {
                let mut guard = q.lock();
                r.sleep(&mut guard);
                n.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    taskolo::this_task::sleep_for(Duration::from_millis(10));

    {
        let _guard = qutex.lock();
        rendez.wakeup_all();
    }

    for waiter in waiters {
        assert_eq!(waiter.join(), Outcome::Completed);
    }
    assert_eq!(resumed.load(Ordering::SeqCst), 3);
}

#[taskolo::test]
fn test_remote_cancel_breaks_io_wait() {
    // Scenario: this scheduler blocks in the io driver; a plain OS thread
    // cancels the waiting task. The self-pipe write must unblock us fast.
    let (rx, _tx) = nix::unistd::pipe().unwrap();

    let watcher = taskolo::spawn(move || {
        // Nothing ever arrives; only the cancel can end this early.
        let _ = taskolo::fd_wait(&rx, Interest::READABLE, Some(Duration::from_secs(5)));
    });

    let remote = watcher.clone();
    let canceler = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        assert!(remote.cancel());
    });

    let start = Instant::now();
    assert_eq!(watcher.join(), Outcome::Canceled);
    assert!(start.elapsed() < Duration::from_millis(500));

    canceler.join().unwrap();
}

#[taskolo::test]
fn test_fd_wait_timeout_then_readiness() {
    let (rx, tx) = nix::unistd::pipe().unwrap();

    let start = Instant::now();
    let ready = taskolo::fd_wait(&rx, Interest::READABLE, Some(Duration::from_millis(20))).unwrap();
    assert!(!ready, "nothing was written yet");
    assert!(start.elapsed() >= Duration::from_millis(15));

    nix::unistd::write(&tx, b"x").unwrap();
    let ready = taskolo::fd_wait(&rx, Interest::READABLE, Some(Duration::from_secs(1))).unwrap();
    assert!(ready);
}

#[taskolo::test]
fn test_migrate_moves_task_to_another_scheduler() {
    // Keep a second scheduler alive long enough to be a migration target.
    let anchor = taskolo::spawn_thread(|| {
        taskolo::this_task::sleep_for(Duration::from_millis(200));
    });

    let home = context::current_scheduler_id().unwrap();
    let hopped = Arc::new(AtomicBool::new(false));
    let hopped_flag = hopped.clone();

    let hopper = taskolo::spawn(move || {
        let from = context::current_scheduler_id().unwrap();
        if taskolo::this_task::migrate() {
            let to = context::current_scheduler_id().unwrap();
            hopped_flag.store(from != to, Ordering::SeqCst);
        }
    });

    assert_eq!(hopper.join(), Outcome::Completed);
    assert!(hopped.load(Ordering::SeqCst), "task did not change schedulers");

    assert_eq!(context::current_scheduler_id().unwrap(), home);
    anchor.cancel();
    anchor.join();
}

#[taskolo::test]
fn test_spawn_thread_runs_on_new_scheduler() {
    let home = context::current_scheduler_id().unwrap();

    let seen = Arc::new(Mutex::new(None));
    let seen_in_task = seen.clone();
    let handle = taskolo::spawn_thread(move || {
        *seen_in_task.lock() = context::current_scheduler_id();
    });

    assert_eq!(handle.join(), Outcome::Completed);
    let remote = seen.lock().expect("task never ran");
    assert_ne!(remote, home);
}

#[taskolo::test]
fn test_cancel_by_id_from_registry() {
    let task = taskolo::spawn(|| {
        taskolo::this_task::sleep_for(Duration::from_secs(10));
    });

    let id = task.id();
    taskolo::this_task::yield_now();
    assert!(taskolo::cancel(id));
    assert_eq!(task.join(), Outcome::Canceled);

    // Gone from the registry once finished.
    assert!(!taskolo::cancel(id));
}

#[taskolo::test]
fn test_sleep_waits_at_least() {
    for ms in [10u64, 25, 40] {
        let start = Instant::now();
        taskolo::this_task::sleep_for(Duration::from_millis(ms));
        assert!(start.elapsed() >= Duration::from_millis(ms));
    }
}

#[taskolo::test]
fn test_yield_reports_progress_of_others() {
    // Alone on the scheduler: nothing else ran.
    assert_eq!(taskolo::this_task::yield_now(), 0);

    let busy = taskolo::spawn(|| {
        for _ in 0..3 {
            taskolo::this_task::yield_now();
        }
    });

    let ran = taskolo::this_task::yield_now();
    assert!(ran >= 1, "the busy task should have run, got {ran}");
    busy.join();
}

#[taskolo::test]
fn test_task_labels() {
    assert_eq!(
        taskolo::this_task::name(),
        format!("task[{}]", taskolo::this_task::id())
    );

    taskolo::this_task::set_name("root-task");
    taskolo::this_task::set_status("testing");
    assert_eq!(taskolo::this_task::name(), "root-task");
    assert_eq!(taskolo::this_task::status(), "testing");

    // Suspension points overwrite the status label.
    taskolo::this_task::yield_now();
    assert_eq!(taskolo::this_task::status(), "yield");
}

#[taskolo::test]
fn test_dump_lists_live_tasks() {
    let sleeper = taskolo::spawn(|| {
        taskolo::this_task::set_name("dumped-task");
        taskolo::this_task::sleep_for(Duration::from_millis(50));
    });

    taskolo::this_task::yield_now();
    // Smoke test: the dump request is served by the loop without disturbing
    // the sleeping task.
    taskolo::runtime::dump();

    assert_eq!(sleeper.join(), Outcome::Completed);
}

#[test]
fn test_block_on_waits_for_detached_user_tasks() -> Result<()> {
    let done = Arc::new(AtomicBool::new(false));
    let done_in_task = done.clone();

    Builder::new().try_build()?.block_on(move || {
        taskolo::spawn_detached(move || {
            taskolo::this_task::sleep_for(Duration::from_millis(30));
            done_in_task.store(true, Ordering::SeqCst);
        });
        // The root returns immediately; the loop still waits for the
        // detached task before block_on returns.
    });

    assert!(done.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn test_system_tasks_do_not_hold_the_runtime() -> Result<()> {
    let cleaned = Arc::new(AtomicBool::new(false));
    let cleaned_in_task = cleaned.clone();
    let start = Instant::now();

    Builder::new().try_build()?.block_on(move || {
        taskolo::spawn_detached(move || {
            taskolo::this_task::make_system();
            let _cleanup = SetOnDrop(cleaned_in_task);
            taskolo::this_task::sleep_for(Duration::from_secs(30));
        });
        // Give the system task a chance to park before the root returns.
        taskolo::this_task::sleep_for(Duration::from_millis(10));
    });

    // The 30s sleeper was canceled, not waited for, and unwound cleanly.
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(cleaned.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn test_sequential_runtimes_on_one_thread() -> Result<()> {
    for round in 0..3 {
        let value = Builder::new().try_build()?.block_on(move || round * 2);
        assert_eq!(value, round * 2);
    }
    Ok(())
}
