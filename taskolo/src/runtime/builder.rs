//! Runtime construction: the `Builder`, the validated `RuntimeConfig`, and
//! `runtime::main` for the common whole-program case.

use crate::context;
use crate::runtime::registry;
use crate::runtime::scheduler::Scheduler;
use crate::utils::sys::page_size;
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Default usable stack per task.
pub(crate) const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Poll interval while the main runtime waits for sibling schedulers to
/// drain during teardown.
const TEARDOWN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub(crate) struct ThreadNameFn(Arc<dyn Fn() -> String + Send + Sync + 'static>);

impl ThreadNameFn {
    pub(crate) fn make(&self) -> String {
        (self.0)()
    }
}

fn default_thread_name_fn() -> ThreadNameFn {
    static WORKER_SEQ: AtomicUsize = AtomicUsize::new(0);
    ThreadNameFn(Arc::new(|| {
        format!(
            "taskolo-worker-{}",
            WORKER_SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The closure itself isn't printable.
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and builds a [`Runtime`].
#[derive(Debug)]
pub struct Builder {
    /// Usable stack size per task, in bytes. Rounded up to whole pages; a
    /// guard page is added on top.
    stack_size: usize,

    /// Name fn for threads spawned via `spawn_thread`.
    thread_name: ThreadNameFn,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            stack_size: DEFAULT_STACK_SIZE,
            thread_name: default_thread_name_fn(),
        }
    }

    /// Sets the usable stack size (in bytes) for spawned tasks.
    pub fn stack_size(mut self, val: usize) -> Self {
        self.stack_size = val;
        self
    }

    /// Sets a fixed name for threads spawned by `spawn_thread`.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function generating names for threads spawned by
    /// `spawn_thread`. The default yields `taskolo-worker-{N}`.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Validates the configuration and creates the `Runtime`.
    pub fn try_build(self) -> Result<Runtime> {
        let cfg: RuntimeConfig = self.try_into()?;
        Ok(Runtime { cfg })
    }
}

/// A handle to the configured runtime. The scheduler itself is built on the
/// thread that calls [`Runtime::block_on`].
#[derive(Debug)]
pub struct Runtime {
    cfg: RuntimeConfig,
}

impl Runtime {
    /// Build a scheduler on the calling thread, run `entry` as its root
    /// task, and drive the event loop until every user task has finished.
    ///
    /// # Panics
    ///
    /// Panics if a runtime is already active on this thread, or if the root
    /// task is canceled before producing its value.
    #[track_caller]
    pub fn block_on<F, R>(&self, entry: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let scheduler = match Scheduler::try_new(self.cfg.clone()) {
            Ok(s) => Rc::new(s),
            Err(e) => panic!("FATAL: failed to build scheduler: {e:?}"),
        };

        let _ctx = match context::enter(scheduler.clone()) {
            Ok(guard) => guard,
            Err(e) => panic!("{e}"),
        };
        let _registration = registry::register_scheduler(scheduler.handle());

        // The root task is special-cased: its panic is captured here and
        // rethrown from block_on, like a thread join. Panics in any other
        // task remain fatal to the process.
        let result = Arc::new(Mutex::new(None));
        let result_slot = result.clone();
        scheduler.spawn(
            Box::new(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry));
                *result_slot.lock() = Some(outcome);
            }),
            false,
        );

        scheduler.run();

        let result = result.lock().take();
        match result.expect("root task was canceled before completing") {
            Ok(value) => value,
            Err(payload) if crate::error::is_interrupt_payload(payload.as_ref()) => {
                panic!("root task was canceled before completing")
            }
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
}

/// Build the first scheduler on the calling thread, run `entry` as the root
/// task, and return the process exit code once every scheduler has drained.
///
/// Teardown fans out through the runtime registry: remaining schedulers on
/// other threads are asked to cancel their tasks, then waited for.
pub fn main<F>(entry: F) -> i32
where
    F: FnOnce() + Send + 'static,
{
    let runtime = match Builder::new().try_build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to build runtime: {e:?}");
            return 1;
        }
    };

    runtime.block_on(entry);

    // The local scheduler has drained and deregistered itself; cancel and
    // wait out any schedulers spawned on other threads.
    registry::shutdown_all();
    while registry::scheduler_count() > 0 {
        std::thread::sleep(TEARDOWN_POLL_INTERVAL);
    }

    0
}

/// Validated runtime configuration shared with every scheduler.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) stack_size: usize,
    pub(crate) thread_name: ThreadNameFn,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            stack_size: DEFAULT_STACK_SIZE,
            thread_name: default_thread_name_fn(),
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        // One page of usable stack is not enough to enter the trampoline.
        if self.stack_size < 2 * page_size() {
            return Err(anyhow!(
                "stack_size must be at least two pages ({} bytes)",
                2 * page_size()
            ));
        }
        Ok(())
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let cfg = RuntimeConfig {
            stack_size: builder.stack_size,
            thread_name: builder.thread_name,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    // The config is cloned into every thread spawned by `spawn_thread`.
    assert_impl_all!(RuntimeConfig: Send, Sync, Clone);

    #[test]
    fn test_stack_size_validated() {
        assert!(Builder::new().stack_size(64).try_build().is_err());
        assert!(Builder::new().stack_size(1 << 20).try_build().is_ok());
    }
}
