use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    NotInstalled,
    Stopped,
    Starting,
    Running,
    Stopping,
    Updating,
}

impl ServerState {
    /// An operation is in flight; every command is rejected while this holds.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServerState::Starting | ServerState::Stopping | ServerState::Updating)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ServerState::NotInstalled => "not installed",
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Updating => "updating",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(ServerState, ServerState),
}

#[derive(Debug)]
pub struct StateMachine {
    state: ServerState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { state: ServerState::NotInstalled }
    }
}

impl StateMachine {
    pub fn new(initial: ServerState) -> Self {
        Self { state: initial }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn can_transition(&self, to: ServerState) -> bool {
        use ServerState::*;
        matches!(
            (self.state, to),
            (NotInstalled, Updating)
                | (Stopped, Updating)
                | (Updating, Stopped)
                | (Updating, NotInstalled)
                | (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Stopping, Stopped)
                // kill could not confirm termination
                | (Stopping, Running)
                // process died on its own
                | (Running, Stopped)
        )
    }

    /// Returns the state that was left.
    pub fn transition(&mut self, to: ServerState) -> Result<ServerState, TransitionError> {
        if self.can_transition(to) {
            tracing::info!("State transition: {:?} -> {:?}", self.state, to);
            let from = self.state;
            self.state = to;
            Ok(from)
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }
}
