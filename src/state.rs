//! Circuit breaker states.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

/// Represents the possible states of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Circuit is closed and calls are allowed.
    Closed = 0,

    /// Circuit is open and calls are rejected.
    Open = 1,

    /// Circuit is allowing a limited number of trial calls.
    HalfOpen = 2,
}

impl State {
    /// Lowercase label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<u8> for State {
    fn from(value: u8) -> Self {
        match value {
            1 => State::Open,
            2 => State::HalfOpen,
            _ => State::Closed,
        }
    }
}

/// Lock-free mirror of the breaker's state.
///
/// Only written while the breaker's core lock is held, so readers see either
/// the old or the new state but transitions are never interleaved.
#[derive(Debug)]
pub(crate) struct StateCell {
    state: AtomicU8,
}

impl StateCell {
    pub(crate) fn new(state: State) -> Self {
        Self {
            state: AtomicU8::new(state as u8),
        }
    }

    pub(crate) fn load(&self) -> State {
        State::from(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_u8() {
        for state in [State::Closed, State::Open, State::HalfOpen] {
            assert_eq!(State::from(state as u8), state);
        }
        assert_eq!(State::from(42), State::Closed);
    }

    #[test]
    fn cell_reflects_last_store() {
        let cell = StateCell::new(State::Closed);
        cell.store(State::HalfOpen);
        assert_eq!(cell.load(), State::HalfOpen);
        assert_eq!(cell.load().to_string(), "half_open");
    }
}
