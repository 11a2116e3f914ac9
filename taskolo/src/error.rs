use std::io;
use thiserror::Error;

/// Errors surfaced by fallible runtime operations.
///
/// Cancellation is not an `Error`: it travels as an unwind (see
/// [`TaskInterrupted`]) so that scoped resources release on the way out.
#[derive(Debug, Error)]
pub enum Error {
    /// A bounded wait elapsed without the operation completing.
    #[error("operation timed out")]
    Timeout,

    /// A file-descriptor level failure, wrapping the OS errno.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The operation was used outside its contract, e.g. an fd wait issued
    /// from outside a task.
    #[error("usage error: {0}")]
    Usage(&'static str),
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Io(io::Error::from_raw_os_error(errno as i32))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Panic payload thrown at a cancellation point after the task was canceled.
///
/// The trampoline swallows it after destructors have run up the task's stack.
/// Catching it in task code is allowed but it must be rethrown or the task
/// must terminate shortly after; the runtime will not deliver it twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInterrupted;

/// Panic payload thrown at a cancellation point once an armed [`Deadline`]
/// has elapsed.
///
/// Behaves as a [`TaskInterrupted`] everywhere the runtime is concerned (the
/// trampoline swallows it too); use [`Deadline::timed`] to observe it without
/// writing `catch_unwind` by hand.
///
/// [`Deadline`]: crate::sync::Deadline
/// [`Deadline::timed`]: crate::sync::Deadline::timed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineReached;

/// Which payload an exception-carrying timer delivers on wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    Interrupted,
    DeadlineReached,
}

impl Interrupt {
    /// Throw the matching payload. Runs on the interrupted task's own stack.
    pub(crate) fn throw(self) -> ! {
        match self {
            Interrupt::Interrupted => std::panic::panic_any(TaskInterrupted),
            Interrupt::DeadlineReached => std::panic::panic_any(DeadlineReached),
        }
    }
}

/// True if an unwind payload is one of the runtime's interrupt markers.
pub(crate) fn is_interrupt_payload(payload: &(dyn std::any::Any + Send)) -> bool {
    payload.is::<TaskInterrupted>() || payload.is::<DeadlineReached>()
}

/// Interrupt unwinds are routine control flow; keep the default panic hook
/// from printing a "thread panicked" line for every canceled task.
pub(crate) fn install_quiet_interrupt_hook() {
    use std::sync::Once;
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let prev = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if is_interrupt_payload(info.payload()) {
                return;
            }
            prev(info);
        }));
    });
}
