//! Scoped deadlines: an exception-carrying timer armed on the current task.

use crate::context;
use crate::error::{DeadlineReached, Interrupt};
use crate::task::TaskRef;
use crate::task::timer::TimerId;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::time::{Duration, Instant};
use tracing::trace;

/// While armed, any cancellation point the current task reaches after the
/// deadline elapses throws [`DeadlineReached`]. Dropping the handle (or
/// calling [`cancel`]) disarms it; a deadline whose scope is left in time
/// never fires.
///
/// A zero duration fires at the very next cancellation point.
///
/// [`cancel`]: Deadline::cancel
#[derive(Debug)]
pub struct Deadline {
    /// Armed state; `None` once canceled.
    armed: Option<(TaskRef, TimerId)>,
    when: Instant,
}

impl Deadline {
    /// Arm a deadline `duration` from now on the current task.
    ///
    /// # Panics
    ///
    /// Panics when called from outside a task.
    #[track_caller]
    pub fn new(duration: Duration) -> Self {
        context::with_scheduler(|s| {
            let task = s
                .current_task()
                .expect("deadline armed outside of a task");
            let when = s.now() + duration;

            let timer = task.arm_timer(when, Some(Interrupt::DeadlineReached));
            s.resync_timers(&task);
            trace!(task = %task.id(), ?duration, "deadline armed");

            Deadline {
                armed: Some((task, timer)),
                when,
            }
        })
    }

    /// Run `f` under a deadline and observe the outcome: `Err` if the
    /// deadline fired and unwound `f`, `Ok` with its value otherwise. Any
    /// other unwind (including a task cancel) keeps propagating.
    #[track_caller]
    pub fn timed<R>(duration: Duration, f: impl FnOnce() -> R) -> Result<R, DeadlineReached> {
        let deadline = Deadline::new(duration);
        let result = catch_unwind(AssertUnwindSafe(f));
        drop(deadline);

        match result {
            Ok(value) => Ok(value),
            Err(payload) if payload.is::<DeadlineReached>() => Err(DeadlineReached),
            Err(payload) => resume_unwind(payload),
        }
    }

    /// Time until the deadline fires; zero when past due or canceled.
    pub fn remaining(&self) -> Duration {
        match &self.armed {
            Some((task, timer)) if task.timer_when(*timer).is_some() => {
                let now = context::with_scheduler(|s| s.now());
                self.when.saturating_duration_since(now)
            }
            _ => Duration::ZERO,
        }
    }

    /// Disarm the deadline. Idempotent; a deadline that already fired is
    /// simply gone.
    pub fn cancel(&mut self) {
        if let Some((task, timer)) = self.armed.take() {
            task.disarm_timer(timer);
            // A fired-but-undelivered interrupt must not escape the scope.
            task.clear_pending(Interrupt::DeadlineReached);
            context::try_with_scheduler(|s| s.resync_timers(&task));
        }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.cancel();
    }
}
