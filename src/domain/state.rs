//! Session lifecycle states and the transition table between them.

use crate::domain::error::SessionError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Discovering,
    Ready,
    Sending,
    Disconnecting,
    Closed,
    Failed,
}

impl SessionState {
    /// `Closed` and `Failed` end a session; a new one must be created.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Only a `Ready` session accepts a new command.
    pub fn accepts_commands(self) -> bool {
        self == Self::Ready
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Idle, Connecting)
            | (Connecting, Discovering)
            | (Discovering, Ready)
            | (Ready, Sending)
            | (Sending, Ready)
            | (Disconnecting, Closed) => true,
            (from, Disconnecting) | (from, Failed) => !from.is_terminal() && from != next,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Single-writer holder of the current state; every change goes through
/// [`StateMachine::transition`].
#[derive(Debug, Default)]
pub struct StateMachine {
    current: SessionState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> SessionState {
        self.current
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&mut self, next: SessionState) -> Result<SessionState, SessionError> {
        if !self.current.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.current,
                to: next,
            });
        }
        Ok(std::mem::replace(&mut self.current, next))
    }
}
