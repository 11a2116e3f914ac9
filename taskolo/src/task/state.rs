//! The task state machine.
//!
//! Transitions happen under a compare-exchange loop so that concurrent
//! cancel requests race safely with the task's own progress. Any edge not
//! listed in [`valid`] is a bug and the transition is refused.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Created, body not yet entered.
    Fresh = 0,
    /// Runnable or running.
    Ready = 1,
    /// Parked at a suspension point.
    Asleep = 2,
    /// Cancel requested, not yet observed at a cancellation point.
    Canceled = 3,
    /// Interrupt thrown, destructors running up the stack.
    Unwinding = 4,
    /// Terminal.
    Finished = 5,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Fresh => "fresh",
            State::Ready => "ready",
            State::Asleep => "asleep",
            State::Canceled => "canceled",
            State::Unwinding => "unwinding",
            State::Finished => "finished",
        };
        f.write_str(name)
    }
}

fn valid(from: State, to: State) -> bool {
    match from {
        State::Fresh => matches!(to, State::Ready | State::Finished),
        State::Ready => matches!(to, State::Asleep | State::Canceled | State::Finished),
        State::Asleep => matches!(to, State::Ready | State::Canceled),
        State::Canceled => matches!(to, State::Unwinding | State::Finished),
        State::Unwinding => matches!(to, State::Finished),
        State::Finished => false,
    }
}

#[derive(Debug)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) fn new(state: State) -> Self {
        AtomicState(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> State {
        // Safety: only `State` discriminants are ever stored.
        unsafe { std::mem::transmute::<u8, State>(self.0.load(Ordering::Acquire)) }
    }

    /// Attempt to transition to `to`, retrying while another thread races
    /// the state forward.
    ///
    /// Returns the state actually reached on success (`Finished` when a
    /// cancel against a `fresh` task collapses directly, skipping the body),
    /// or `None` if the requested edge is not legal from the current state.
    pub(crate) fn transition(&self, to: State) -> Option<State> {
        loop {
            let from = self.load();

            // A cancel before the body ever ran needs no unwinding.
            let to = if from == State::Fresh && to == State::Canceled {
                State::Finished
            } else {
                to
            };

            if !valid(from, to) {
                return None;
            }

            if self
                .0
                .compare_exchange_weak(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(to);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const ALL: [State; 6] = [
        State::Fresh,
        State::Ready,
        State::Asleep,
        State::Canceled,
        State::Unwinding,
        State::Finished,
    ];

    #[rstest]
    #[case::fresh(State::Fresh, &[State::Ready, State::Finished])]
    #[case::ready(State::Ready, &[State::Asleep, State::Canceled, State::Finished])]
    #[case::asleep(State::Asleep, &[State::Ready, State::Canceled])]
    #[case::canceled(State::Canceled, &[State::Unwinding, State::Finished])]
    #[case::unwinding(State::Unwinding, &[State::Finished])]
    #[case::finished(State::Finished, &[])]
    fn test_transition_table(#[case] from: State, #[case] allowed: &[State]) {
        for to in ALL {
            let state = AtomicState::new(from);
            let res = state.transition(to);

            // `fresh + cancel` is special-cased below.
            if from == State::Fresh && to == State::Canceled {
                continue;
            }

            if allowed.contains(&to) {
                assert_eq!(res, Some(to), "{from} -> {to} should be allowed");
                assert_eq!(state.load(), to);
            } else {
                assert_eq!(res, None, "{from} -> {to} should be refused");
                assert_eq!(state.load(), from);
            }
        }
    }

    #[test]
    fn test_cancel_fresh_collapses_to_finished() {
        let state = AtomicState::new(State::Fresh);
        assert_eq!(state.transition(State::Canceled), Some(State::Finished));
        assert_eq!(state.load(), State::Finished);
    }

    #[test]
    fn test_double_cancel_is_refused() {
        let state = AtomicState::new(State::Ready);
        assert_eq!(state.transition(State::Canceled), Some(State::Canceled));
        assert_eq!(state.transition(State::Canceled), None);
    }
}
