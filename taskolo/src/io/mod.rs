//! Edge-triggered I/O multiplexing, one driver per scheduler.
//!
//! A file descriptor maps to at most one reader task and one writer task
//! (possibly the same task). The mask registered with epoll is always the
//! union of the two interests. Readiness dispatch vacates the slot (waits
//! are single-shot; re-arm by waiting again) and shrinks or deletes the
//! registration accordingly.
//!
//! The driver additionally owns the read end of the scheduler's self-pipe,
//! permanently registered, so any thread can break an in-progress wait with
//! a one-byte write to the other end.

use crate::context;
use crate::error::{Error, Result};
use crate::task::{Id, State, TaskRef};
use crate::utils::ScopeGuard;
use bitflags::bitflags;
use nix::fcntl::OFlag;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::unistd::pipe2;
use slab::Slab;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::Duration;
use tracing::trace;

bitflags! {
    /// Which readiness a task is waiting for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READABLE = 1;
        const WRITABLE = 1 << 1;
    }
}

/// Event token reserved for the self-pipe; fd slots use their slab key.
const WAKE_TOKEN: u64 = u64::MAX;

/// Events fetched per epoll_wait call.
const EVENT_BATCH: usize = 64;

#[derive(Debug)]
struct FdEntry {
    fd: RawFd,
    reader: Option<TaskRef>,
    writer: Option<TaskRef>,
}

impl FdEntry {
    fn mask(&self) -> EpollFlags {
        let mut flags = EpollFlags::EPOLLET;
        if self.reader.is_some() {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.writer.is_some() {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }

    fn is_empty(&self) -> bool {
        self.reader.is_none() && self.writer.is_none()
    }
}

#[derive(Debug)]
pub(crate) struct Driver {
    epoll: Epoll,

    /// Self-pipe read end; the write end lives in the scheduler's shared
    /// state so remote threads can reach it.
    wake_rx: OwnedFd,

    entries: Slab<FdEntry>,
    by_fd: HashMap<RawFd, usize>,

    /// Live per-direction registrations. Zero means the scheduler parks on
    /// its condvar instead of polling.
    waiters: usize,
}

impl Driver {
    /// Build the driver. Returns the write end of the self-pipe for the
    /// scheduler's shared state.
    pub(crate) fn new() -> Result<(Self, OwnedFd)> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let (wake_rx, wake_tx) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;

        // Level-triggered on purpose: an un-drained wake byte keeps
        // reporting until consumed.
        epoll.add(&wake_rx, EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN))?;

        Ok((
            Driver {
                epoll,
                wake_rx,
                entries: Slab::new(),
                by_fd: HashMap::new(),
                waiters: 0,
            },
            wake_tx,
        ))
    }

    pub(crate) fn has_waiters(&self) -> bool {
        self.waiters > 0
    }

    /// Register `task` as the waiter for `interest` on `fd`.
    ///
    /// At most one task per direction; a second reader (or writer) is a
    /// usage error. Registration is all-or-nothing: a combined read+write
    /// request that fails either direction, or an epoll syscall failure,
    /// leaves the table and the kernel registration untouched.
    pub(crate) fn register(&mut self, fd: RawFd, interest: Interest, task: &TaskRef) -> Result<()> {
        // Validate both directions before mutating anything.
        if let Some(&key) = self.by_fd.get(&fd) {
            let entry = &self.entries[key];
            if interest.contains(Interest::READABLE)
                && entry.reader.as_ref().is_some_and(|t| t.id() != task.id())
            {
                return Err(Error::Usage("fd already has a reader task"));
            }
            if interest.contains(Interest::WRITABLE)
                && entry.writer.as_ref().is_some_and(|t| t.id() != task.id())
            {
                return Err(Error::Usage("fd already has a writer task"));
            }
        }

        let (key, is_new) = match self.by_fd.get(&fd) {
            Some(&key) => (key, false),
            None => {
                let key = self.entries.insert(FdEntry {
                    fd,
                    reader: None,
                    writer: None,
                });
                self.by_fd.insert(fd, key);
                (key, true)
            }
        };

        let entry = &mut self.entries[key];
        let prev_reader = entry.reader.clone();
        let prev_writer = entry.writer.clone();
        let prev_waiters = self.waiters;

        if interest.contains(Interest::READABLE) && entry.reader.replace(task.clone()).is_none() {
            self.waiters += 1;
        }
        if interest.contains(Interest::WRITABLE) && entry.writer.replace(task.clone()).is_none() {
            self.waiters += 1;
        }

        let event = EpollEvent::new(self.entries[key].mask(), key as u64);
        if let Err(e) = self.update_registration(fd, event, is_new) {
            // The kernel kept the old mask; restore the table to match.
            let entry = &mut self.entries[key];
            entry.reader = prev_reader;
            entry.writer = prev_writer;
            self.waiters = prev_waiters;
            if is_new {
                self.entries.remove(key);
                self.by_fd.remove(&fd);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Remove `task_id`'s registration for `interest` on `fd`, shrinking or
    /// deleting the epoll entry. Idempotent: dispatch may already have
    /// vacated the slot.
    pub(crate) fn deregister(&mut self, fd: RawFd, interest: Interest, task_id: Id) {
        let Some(&key) = self.by_fd.get(&fd) else {
            return;
        };

        let entry = &mut self.entries[key];
        if interest.contains(Interest::READABLE)
            && entry.reader.as_ref().is_some_and(|t| t.id() == task_id)
        {
            entry.reader = None;
            self.waiters -= 1;
        }
        if interest.contains(Interest::WRITABLE)
            && entry.writer.as_ref().is_some_and(|t| t.id() == task_id)
        {
            entry.writer = None;
            self.waiters -= 1;
        }

        if let Err(e) = self.sync_after_shrink(key) {
            tracing::error!(fd, "failed to update epoll registration: {}", e);
        }
    }

    /// Block for readiness up to `bound`, returning the tasks to wake.
    /// EINTR is treated as an empty wakeup so the loop can re-check flags.
    pub(crate) fn poll(&mut self, bound: Option<Duration>) -> Result<Vec<TaskRef>> {
        let mut events = [EpollEvent::empty(); EVENT_BATCH];

        let n = match self.epoll.wait(&mut events, epoll_timeout(bound)) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => 0,
            Err(e) => return Err(e.into()),
        };

        let mut woken = Vec::new();
        for event in &events[..n] {
            if event.data() == WAKE_TOKEN {
                self.drain_wake_pipe();
                continue;
            }

            let key = event.data() as usize;
            let Some(entry) = self.entries.get_mut(key) else {
                // Stale event for a registration removed this batch.
                continue;
            };

            let flags = event.events();
            let fault = flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP);

            if flags.contains(EpollFlags::EPOLLIN) || fault {
                if let Some(task) = entry.reader.take() {
                    self.waiters -= 1;
                    task.set_io_ready();
                    woken.push(task);
                }
            }

            let entry = &mut self.entries[key];
            if flags.contains(EpollFlags::EPOLLOUT) || fault {
                if let Some(task) = entry.writer.take() {
                    self.waiters -= 1;
                    task.set_io_ready();
                    // The same task waiting on both directions is woken once.
                    if woken.last().is_none_or(|t| t.id() != task.id()) {
                        woken.push(task);
                    }
                }
            }

            if let Err(e) = self.sync_after_shrink(key) {
                tracing::error!("failed to update epoll registration: {}", e);
            }
        }

        trace!(woken = woken.len(), "io readiness dispatched");
        Ok(woken)
    }

    fn update_registration(&self, fd: RawFd, mut event: EpollEvent, is_new: bool) -> Result<()> {
        // Safety: the caller guarantees fd outlives the registration; the
        // borrow lasts only for the syscall.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if is_new {
            self.epoll.add(borrowed, event)?;
        } else {
            self.epoll.modify(borrowed, &mut event)?;
        }
        Ok(())
    }

    /// After slots were vacated: shrink the mask or drop the registration.
    fn sync_after_shrink(&mut self, key: usize) -> Result<()> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(());
        };

        let fd = entry.fd;
        // Safety: see update_registration.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };

        if entry.is_empty() {
            self.entries.remove(key);
            self.by_fd.remove(&fd);
            self.epoll.delete(borrowed)?;
        } else {
            let mut event = EpollEvent::new(entry.mask(), key as u64);
            self.epoll.modify(borrowed, &mut event)?;
        }
        Ok(())
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            match nix::unistd::read(self.wake_rx.as_raw_fd(), &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }
}

/// Write one byte into a scheduler's self-pipe. A full pipe means a wake is
/// already pending, which is just as good.
pub(crate) fn wake_by_pipe(wake_tx: &OwnedFd) {
    let _ = nix::unistd::write(wake_tx, &[1u8]);
}

fn epoll_timeout(bound: Option<Duration>) -> EpollTimeout {
    match bound {
        None => EpollTimeout::NONE,
        Some(d) if d.is_zero() => EpollTimeout::ZERO,
        Some(d) => {
            // Round sub-millisecond bounds up so near timers don't spin, and
            // clamp far ones into the convertible range.
            let d = d
                .max(Duration::from_millis(1))
                .min(Duration::from_secs(60 * 60 * 24));
            EpollTimeout::try_from(d).unwrap_or(EpollTimeout::NONE)
        }
    }
}

/// Suspend the current task until `fd` is ready for `interest` or `timeout`
/// elapses. Returns `Ok(true)` on readiness, `Ok(false)` on timeout.
///
/// This is a suspension point and therefore a cancellation point. The fd
/// registration and the timeout timer are removed on every exit path,
/// including the cancel unwind.
pub fn fd_wait<F: AsRawFd>(fd: &F, interest: Interest, timeout: Option<Duration>) -> Result<bool> {
    let fd = fd.as_raw_fd();

    context::try_with_scheduler(|s| -> Result<bool> {
        let Some(task) = s.current_task() else {
            return Err(Error::Usage("fd_wait called outside of a task"));
        };
        task.set_status("fdwait");

        // The cleanup guard exists before the registration does: deregister
        // is idempotent, and no exit path may leave a stale slot behind.
        let task_id = task.id();
        let _io_cleanup = ScopeGuard::new(|| s.io_deregister(fd, interest, task_id));
        s.io_register(fd, interest, &task)?;

        let deadline = timeout.map(|d| s.now() + d);
        let timer_task = task.clone();
        let timer = deadline.map(|when| {
            let id = task.arm_timer(when, None);
            s.resync_timers(&task);
            id
        });
        let _timer_cleanup = ScopeGuard::new(|| {
            if let Some(id) = timer {
                timer_task.disarm_timer(id);
                s.resync_timers(&timer_task);
            }
        });

        loop {
            let _ = task.transition(State::Asleep);
            s.suspend();

            if task.take_io_ready() {
                return Ok(true);
            }
            if deadline.is_some_and(|when| s.now() >= when) {
                return Ok(false);
            }
            // Spurious wake: park again.
        }
    })
    .unwrap_or(Err(Error::Usage("fd_wait called outside of a runtime")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use crate::runtime::scheduler::Scheduler;
    use crate::task::Task;
    use crate::task::stack::Stack;

    extern "C" fn unused_entry() -> ! {
        unreachable!("test tasks are never scheduled");
    }

    #[test]
    fn test_driver_tracks_waiter_count() -> anyhow::Result<()> {
        let (driver, _wake_tx) = Driver::new()?;
        assert!(!driver.has_waiters());
        Ok(())
    }

    #[test]
    fn test_register_is_all_or_nothing() -> anyhow::Result<()> {
        let scheduler = Scheduler::try_new(RuntimeConfig::default())?;
        let handle = scheduler.handle();
        let make_task = || {
            Task::new(
                Box::new(|| {}),
                Stack::with_size(32 * 1024).unwrap(),
                handle.clone(),
                unused_entry,
            )
        };

        let (mut driver, _wake_tx) = Driver::new()?;
        let (rx, _tx) = nix::unistd::pipe()?;
        let fd = rx.as_raw_fd();

        let writer = make_task();
        driver.register(fd, Interest::WRITABLE, &writer)?;
        assert!(driver.has_waiters());

        // A combined request whose read side passes but whose write side
        // conflicts must change nothing.
        let both = make_task();
        assert!(matches!(
            driver.register(fd, Interest::READABLE | Interest::WRITABLE, &both),
            Err(Error::Usage(_))
        ));

        // In particular, no phantom reader claim may be left behind: the
        // read side is still free for a clean registration.
        let reader = make_task();
        driver.register(fd, Interest::READABLE, &reader)?;

        driver.deregister(fd, Interest::READABLE, reader.id());
        driver.deregister(fd, Interest::WRITABLE, writer.id());
        assert!(!driver.has_waiters());
        Ok(())
    }

    #[test]
    fn test_epoll_timeout_rounds_up() {
        // No bound blocks forever, zero polls, sub-millisecond rounds to 1ms.
        assert_eq!(epoll_timeout(None), EpollTimeout::NONE);
        assert_eq!(epoll_timeout(Some(Duration::ZERO)), EpollTimeout::ZERO);
        assert_eq!(
            epoll_timeout(Some(Duration::from_micros(10))),
            EpollTimeout::try_from(Duration::from_millis(1)).unwrap()
        );
    }
}
