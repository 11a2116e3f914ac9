//! Timers: each task keeps its own small sorted list of due times; each
//! scheduler keeps an index of tasks that currently have at least one live
//! timer, ordered by each task's earliest timer.

use crate::error::Interrupt;
use crate::task::{Id, TaskRef};
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

pub(crate) type TimerId = u64;

#[derive(Debug, Clone, Copy)]
pub(crate) struct TimerEntry {
    pub(crate) id: TimerId,
    pub(crate) when: Instant,
    /// A bare timer wakes normally; an exception-carrying one throws.
    pub(crate) interrupt: Option<Interrupt>,
}

/// A task's own timers, sorted by `when` with ties resolved by insertion
/// order. One for sleep, one for a deadline, occasionally one for a timed
/// lock. The inline capacity covers the norm.
#[derive(Debug, Default)]
pub(crate) struct TimerSet {
    entries: SmallVec<[TimerEntry; 2]>,
    next_id: TimerId,
}

impl TimerSet {
    pub(crate) fn insert(&mut self, when: Instant, interrupt: Option<Interrupt>) -> TimerId {
        self.next_id += 1;
        let entry = TimerEntry {
            id: self.next_id,
            when,
            interrupt,
        };

        // Ties go after existing entries with the same `when`.
        let at = self.entries.partition_point(|e| e.when <= when);
        self.entries.insert(at, entry);
        entry.id
    }

    /// Remove by id; a no-op when the timer already fired.
    pub(crate) fn remove(&mut self, id: TimerId) {
        self.entries.retain(|e| e.id != id);
    }

    /// Pop the earliest entry if it is due at `now`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<TimerEntry> {
        if self.entries.first().is_some_and(|e| e.when <= now) {
            Some(self.entries.remove(0))
        } else {
            None
        }
    }

    pub(crate) fn earliest(&self) -> Option<Instant> {
        self.entries.first().map(|e| e.when)
    }

    pub(crate) fn when_of(&self, id: TimerId) -> Option<Instant> {
        self.entries.iter().find(|e| e.id == id).map(|e| e.when)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Scheduler-side index: which tasks have a live timer, ordered by each
/// task's earliest `when`. A task appears here iff its `TimerSet` is
/// non-empty; `resync` restores that invariant after any mutation.
///
/// The map key carries an insertion sequence so equal deadlines keep
/// insertion order and never collide.
#[derive(Debug, Default)]
pub(crate) struct TimerIndex {
    by_when: BTreeMap<(Instant, u64), TaskRef>,
    keys: HashMap<Id, (Instant, u64)>,
    seq: u64,
}

impl TimerIndex {
    /// Re-derive this task's index entry from its current `TimerSet`.
    pub(crate) fn resync(&mut self, task: &TaskRef) {
        if let Some(key) = self.keys.remove(&task.id()) {
            self.by_when.remove(&key);
        }

        if let Some(when) = task.earliest_timer() {
            self.seq += 1;
            let key = (when, self.seq);
            self.by_when.insert(key, task.clone());
            self.keys.insert(task.id(), key);
        }
    }

    /// Drop a task from the index regardless of its timers (migration,
    /// retirement).
    pub(crate) fn remove(&mut self, id: Id) {
        if let Some(key) = self.keys.remove(&id) {
            self.by_when.remove(&key);
        }
    }

    /// Earliest deadline across all indexed tasks; the scheduler's park
    /// bound.
    pub(crate) fn next_when(&self) -> Option<Instant> {
        self.by_when.keys().next().map(|(when, _)| *when)
    }

    /// Pop every task whose earliest timer is due at `now`, in firing order.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<TaskRef> {
        let mut due = Vec::new();
        while let Some((&key, _)) = self.by_when.first_key_value() {
            if key.0 > now {
                break;
            }
            let task = self.by_when.remove(&key).expect("key just observed");
            self.keys.remove(&task.id());
            due.push(task);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timer_set_orders_by_when() {
        let now = Instant::now();
        let mut set = TimerSet::default();

        let late = set.insert(now + Duration::from_millis(50), None);
        let early = set.insert(now + Duration::from_millis(10), None);

        assert_eq!(set.earliest(), Some(now + Duration::from_millis(10)));

        let fired = set.pop_due(now + Duration::from_millis(20)).unwrap();
        assert_eq!(fired.id, early);

        // The later timer is not due yet.
        assert!(set.pop_due(now + Duration::from_millis(20)).is_none());
        assert_eq!(set.when_of(late), Some(now + Duration::from_millis(50)));
    }

    #[test]
    fn test_timer_set_ties_keep_insertion_order() {
        let when = Instant::now();
        let mut set = TimerSet::default();

        let first = set.insert(when, None);
        let second = set.insert(when, None);

        assert_eq!(set.pop_due(when).unwrap().id, first);
        assert_eq!(set.pop_due(when).unwrap().id, second);
        assert!(set.is_empty());
    }

    #[test]
    fn test_timer_set_remove_is_idempotent() {
        let now = Instant::now();
        let mut set = TimerSet::default();

        let id = set.insert(now, None);
        set.remove(id);
        set.remove(id);
        assert!(set.is_empty());
    }
}
