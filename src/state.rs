//! Server lifecycle state.
//!
//! The state only moves forward:
//!
//! ```text
//! Void -> Inited -> Running -> ShuttingDown -> Terminated
//!            \________________/
//!             shutdown before run
//! ```
//!
//! It is written only by the lifecycle controller and read lock-free by any
//! thread, including queue workers deciding whether to invoke a handler.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerState {
    Void = 0,
    Inited = 1,
    Running = 2,
    ShuttingDown = 3,
    Terminated = 4,
}

impl ServerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ServerState::Void,
            1 => ServerState::Inited,
            2 => ServerState::Running,
            3 => ServerState::ShuttingDown,
            _ => ServerState::Terminated,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Void => "VOID",
            ServerState::Inited => "INITED",
            ServerState::Running => "RUNNING",
            ServerState::ShuttingDown => "SHUTTING_DOWN",
            ServerState::Terminated => "TERMINATED",
        }
    }

    /// Whether `self -> to` is a legal lifecycle step.
    #[must_use]
    pub fn can_advance_to(self, to: ServerState) -> bool {
        matches!(
            (self, to),
            (ServerState::Void, ServerState::Inited)
                | (ServerState::Inited, ServerState::Running)
                | (ServerState::Inited, ServerState::ShuttingDown)
                | (ServerState::Running, ServerState::ShuttingDown)
                | (ServerState::ShuttingDown, ServerState::Terminated)
        )
    }

    /// True once shutdown has begun.
    #[must_use]
    pub fn is_stopping(self) -> bool {
        self >= ServerState::ShuttingDown
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic cell holding a [`ServerState`].
#[derive(Debug)]
pub(crate) struct AtomicServerState(AtomicU8);

impl AtomicServerState {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ServerState::Void as u8))
    }

    pub(crate) fn load(&self) -> ServerState {
        ServerState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves `from -> to`. Fails if the step is illegal or another writer got
    /// there first.
    pub(crate) fn advance(&self, from: ServerState, to: ServerState) -> bool {
        if !from.can_advance_to(to) {
            return false;
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_lifecycle_advances_in_order() {
        let state = AtomicServerState::new();
        assert_eq!(state.load(), ServerState::Void);
        assert!(state.advance(ServerState::Void, ServerState::Inited));
        assert!(state.advance(ServerState::Inited, ServerState::Running));
        assert!(state.advance(ServerState::Running, ServerState::ShuttingDown));
        assert!(state.advance(ServerState::ShuttingDown, ServerState::Terminated));
        assert_eq!(state.load(), ServerState::Terminated);
    }

    #[test]
    fn test_state_never_moves_backward_or_skips() {
        let state = AtomicServerState::new();
        assert!(!state.advance(ServerState::Void, ServerState::Running));
        assert!(state.advance(ServerState::Void, ServerState::Inited));
        assert!(!state.advance(ServerState::Inited, ServerState::Void));
        assert!(!state.advance(ServerState::Inited, ServerState::Terminated));
        assert!(state.advance(ServerState::Inited, ServerState::ShuttingDown));
        assert!(!state.advance(ServerState::ShuttingDown, ServerState::Running));
        assert_eq!(state.load(), ServerState::ShuttingDown);
    }

    #[test]
    fn test_stale_writer_loses() {
        let state = AtomicServerState::new();
        assert!(state.advance(ServerState::Void, ServerState::Inited));
        assert!(state.advance(ServerState::Inited, ServerState::Running));
        // A second writer still believing the server is INITED must fail.
        assert!(!state.advance(ServerState::Inited, ServerState::ShuttingDown));
        assert_eq!(state.load(), ServerState::Running);
    }

    #[test]
    fn test_is_stopping() {
        assert!(!ServerState::Running.is_stopping());
        assert!(ServerState::ShuttingDown.is_stopping());
        assert!(ServerState::Terminated.is_stopping());
        assert_eq!(ServerState::ShuttingDown.to_string(), "SHUTTING_DOWN");
    }
}
