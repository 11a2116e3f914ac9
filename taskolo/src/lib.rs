//! taskolo: a cooperative M:N task runtime.
//!
//! Many lightweight stackful tasks are multiplexed onto a small number of OS
//! threads. Each thread runs its own scheduler with its own ready queue,
//! timer index, and epoll-based io driver; tasks run until they reach a
//! suspension point (yield, sleep, lock, fd wait, join) and never migrate
//! unless they explicitly ask to.
//!
//! ```no_run
//! #[taskolo::main]
//! fn main() {
//!     let handle = taskolo::spawn(|| {
//!         taskolo::this_task::sleep_for(std::time::Duration::from_millis(10));
//!         println!("hello from task {}", taskolo::this_task::id());
//!     });
//!     handle.join();
//! }
//! ```

#[doc(inline)]
pub use taskolo_macros::main;

#[doc(inline)]
pub use taskolo_macros::test;

pub mod context;

pub mod error;
pub use error::{DeadlineReached, Error, TaskInterrupted};

pub mod io;
pub use io::{Interest, fd_wait};

pub mod runtime;
pub use runtime::{Builder, Runtime, cancel, spawn, spawn_detached, spawn_thread};

pub mod signal;
pub use signal::install_dump_signal;

pub mod sync;
pub use sync::{Deadline, Qutex, QutexGuard, Rendez};

pub mod task;
pub use task::{Id, JoinHandle, Outcome};

pub mod this_task;

pub(crate) mod utils;
