//! Node lifecycle state.
//!
//! A small atomic carrier. The state is polled — there are no subscribers to
//! notify on change — so acquire/release ordering is all that is needed.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Lifecycle state of a validator node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Exchanging events with peers; the normal operating state.
    Gossiping,
    /// A peer reported us over the sync limit; catching up instead of
    /// syncing event by event.
    CatchingUp,
    /// Terminal. Once entered, never left.
    Shutdown,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Gossiping => "Gossiping",
            State::CatchingUp => "CatchingUp",
            State::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

impl State {
    fn as_u8(self) -> u8 {
        match self {
            State::Gossiping => 0,
            State::CatchingUp => 1,
            State::Shutdown => 2,
        }
    }

    fn from_u8(raw: u8) -> State {
        match raw {
            0 => State::Gossiping,
            1 => State::CatchingUp,
            _ => State::Shutdown,
        }
    }
}

/// Atomic state variable plus the independent `starting` flag.
///
/// `Shutdown` is a sink: [`set`](Self::set) refuses to transition away from
/// it, so a racing `CatchingUp → Gossiping` flip cannot resurrect a node
/// that is going down.
#[derive(Debug)]
pub struct NodeState {
    state: AtomicU8,
    starting: AtomicBool,
}

impl NodeState {
    /// A fresh node: `Gossiping`, with the `starting` flag raised.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(State::Gossiping.as_u8()),
            starting: AtomicBool::new(true),
        }
    }

    pub fn get(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transitions to `state`, unless already shut down.
    pub fn set(&self, state: State) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (State::from_u8(current) != State::Shutdown).then_some(state.as_u8())
            });
    }

    /// Enters `Shutdown`. Returns `true` for the caller that performed the
    /// transition, `false` if the node was already shut down.
    pub fn shutdown(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (State::from_u8(current) != State::Shutdown).then_some(State::Shutdown.as_u8())
            })
            .is_ok()
    }

    pub fn is_starting(&self) -> bool {
        self.starting.load(Ordering::Acquire)
    }

    pub fn set_starting(&self, starting: bool) {
        self.starting.store(starting, Ordering::Release);
    }
}

impl Default for NodeState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_gossiping_and_starting() {
        let state = NodeState::new();
        assert_eq!(state.get(), State::Gossiping);
        assert!(state.is_starting());
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        let state = NodeState::new();
        state.set(State::CatchingUp);
        assert_eq!(state.get(), State::CatchingUp);
        state.set(State::Gossiping);
        assert_eq!(state.get(), State::Gossiping);
    }

    #[test]
    fn shutdown_is_a_sink() {
        let state = NodeState::new();
        assert!(state.shutdown());
        assert!(!state.shutdown());
        state.set(State::Gossiping);
        assert_eq!(state.get(), State::Shutdown);
    }

    #[test]
    fn starting_flag_is_independent() {
        let state = NodeState::new();
        state.set(State::CatchingUp);
        assert!(state.is_starting());
        state.set_starting(false);
        assert!(!state.is_starting());
        assert_eq!(state.get(), State::CatchingUp);
    }
}
