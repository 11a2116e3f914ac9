//! Signal hygiene.
//!
//! The runtime never steals signals the host process uses. It does two
//! things: on first use it makes sure `SIGPIPE` is ignored (restoring any
//! custom handler the host had already installed), and it offers an opt-in
//! diagnostic signal that dumps all live tasks.
//!
//! The dump handler itself is async-signal-safe: it writes one byte into a
//! dedicated self-pipe. A small watcher thread drains that pipe and fans the
//! request out through the registry, which takes every scheduler's normal
//! wakeup path (condvar or io self-pipe). A fully idle scheduler is
//! therefore woken exactly like it would be by a remote cancel, and the
//! dump itself runs on the scheduler loops, never in the handler.

use crate::error::{Error, Result};
use crate::runtime::registry;
use nix::fcntl::OFlag;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::unistd::pipe2;
use parking_lot::Mutex;
use std::os::fd::{AsRawFd, IntoRawFd};
use std::sync::Once;
use std::sync::atomic::{AtomicI32, Ordering};

/// Write end of the dump self-pipe, or -1 until the watcher is up. Lives for
/// the rest of the process once initialized.
static DUMP_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

extern "C" fn dump_handler(_signo: libc::c_int) {
    // Nothing but an async-signal-safe write lands here; the watcher thread
    // turns the byte into per-scheduler dump requests.
    let fd = DUMP_PIPE_WR.load(Ordering::Acquire);
    if fd >= 0 {
        let byte = [1u8];
        unsafe {
            libc::write(fd, byte.as_ptr().cast(), 1);
        }
    }
}

/// Ensure `SIGPIPE` is ignored so a peer closing a socket surfaces as
/// `EPIPE` instead of killing the process. A handler the host installed
/// beforehand is left in place.
pub(crate) fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        // Safety: replacing the disposition of SIGPIPE; the old action is
        // restored immediately if it was anything but the default.
        unsafe {
            match sigaction(Signal::SIGPIPE, &ignore) {
                Ok(old) if old.handler() != SigHandler::SigDfl => {
                    // The host had its own disposition; put it back.
                    let _ = sigaction(Signal::SIGPIPE, &old);
                }
                Ok(_) => {}
                Err(e) => tracing::error!("failed to ignore SIGPIPE: {}", e),
            }
        }
    });
}

/// Create the dump self-pipe and start the thread that serves it. Runs at
/// most once for the process.
fn ensure_dump_watcher() -> Result<()> {
    static STARTED: Mutex<bool> = Mutex::new(false);

    let mut started = STARTED.lock();
    if *started {
        return Ok(());
    }

    // The read end stays blocking so the watcher can sleep in read(2); only
    // the write end is non-blocking, so a signal storm cannot stall the
    // handler once the pipe is full (a full pipe means a dump is already on
    // its way).
    let (rx, tx) = pipe2(OFlag::O_CLOEXEC)?;
    let tx = tx.into_raw_fd();
    unsafe {
        libc::fcntl(tx, libc::F_SETFL, libc::O_NONBLOCK);
    }

    std::thread::Builder::new()
        .name("taskolo-dump".into())
        .spawn(move || {
            let mut buf = [0u8; 64];
            loop {
                match nix::unistd::read(rx.as_raw_fd(), &mut buf) {
                    // The write end is never closed once published.
                    Ok(0) => break,
                    Ok(_) => registry::dump_all(),
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        tracing::error!("dump watcher pipe failed: {}", e);
                        break;
                    }
                }
            }
        })
        .map_err(Error::Io)?;

    DUMP_PIPE_WR.store(tx, Ordering::Release);
    *started = true;
    Ok(())
}

/// Install the diagnostic dump on a signal of the caller's choosing (for
/// example `SIGUSR1`). When it arrives, every scheduler prints its live
/// tasks to stderr.
pub fn install_dump_signal(signo: i32) -> Result<()> {
    let signal = Signal::try_from(signo)
        .map_err(|_| Error::Usage("not a valid signal number"))?;

    ensure_dump_watcher()?;

    let action = SigAction::new(
        SigHandler::Handler(dump_handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    // Safety: installs a handler that only touches an atomic and write(2).
    unsafe {
        sigaction(signal, &action)?;
    }
    Ok(())
}
