use std::fmt;
use std::num::{NonZeroU32, NonZeroU64};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// An opaque ID that uniquely identifies a task for the lifetime of the
/// process.
///
/// IDs are monotonic and never reused. The ID of the currently running task
/// is available from inside the task via [`this_task::id()`] and
/// [`this_task::try_id()`], and from outside via [`JoinHandle::id()`].
///
/// [`this_task::id()`]: crate::this_task::id
/// [`this_task::try_id()`]: crate::this_task::try_id
/// [`JoinHandle::id()`]: crate::task::JoinHandle::id
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct Id(pub(crate) NonZeroU64);

impl Id {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        // Safety margin, not a real concern: at a billion spawns per second
        // the 64-bit space lasts for centuries.
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique task ID: bitspace exhausted")
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies one scheduler (one OS thread running an event loop).
#[derive(Eq, PartialEq, Clone, Copy, Hash, Debug)]
pub(crate) struct SchedulerId(NonZeroU32);

impl SchedulerId {
    pub(crate) fn next() -> SchedulerId {
        static COUNTER: AtomicU32 = AtomicU32::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        let Some(id) = NonZeroU32::new(id) else {
            Self::exhausted();
        };

        SchedulerId(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique scheduler ID: bitspace exhausted")
    }
}

impl fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_task_ids_unique() {
        let n = 100;
        let ids: HashSet<Id> = (0..n).map(|_| Id::next()).collect();
        assert_eq!(ids.len(), n);
    }

    #[test]
    fn test_task_ids_monotonic() {
        let a = Id::next();
        let b = Id::next();
        assert!(b > a);
    }
}
