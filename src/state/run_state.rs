//! Run state machine
//!
//! PENDING → STARTING → RUNNING → {SUCCEEDED | FAILED | KILLED | TIMED_OUT | EXCEPTION}
//!
//! A run killed before it spawns goes straight from PENDING or STARTING to
//! KILLED. Terminal states never re-enter RUNNING.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{next_seq, TerminalState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Waiting for start or for its predecessor
    Pending,
    /// Spawning the process
    Starting,
    /// Process is alive
    Running,
    /// Exited with status 0
    Succeeded,
    /// Exited with a nonzero status
    Failed,
    /// Stopped by `kill()`
    Killed,
    /// Stopped because its timeout passed
    TimedOut,
    /// Spawn, wait, or bookkeeping raised an error
    Exception,
}

impl TerminalState for RunState {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded
                | RunState::Failed
                | RunState::Killed
                | RunState::TimedOut
                | RunState::Exception
        )
    }
}

impl RunState {
    /// Check if transition from this state to target is valid
    pub fn can_transition_to(&self, target: RunState) -> bool {
        match (self, target) {
            (RunState::Pending, RunState::Starting) => true,
            (RunState::Pending, RunState::Killed) => true,
            (RunState::Pending, RunState::Exception) => true,

            (RunState::Starting, RunState::Running) => true,
            (RunState::Starting, RunState::Killed) => true,
            (RunState::Starting, RunState::Exception) => true,

            (RunState::Running, RunState::Succeeded) => true,
            (RunState::Running, RunState::Failed) => true,
            (RunState::Running, RunState::Killed) => true,
            (RunState::Running, RunState::TimedOut) => true,
            (RunState::Running, RunState::Exception) => true,

            _ => false,
        }
    }
}

/// Current state plus when and in what order it was entered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStateData {
    pub state: RunState,
    pub updated_at: DateTime<Utc>,
    pub seq: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RunStateError {
    #[error("Invalid run transition from {from:?} to {to:?}")]
    InvalidTransition { from: RunState, to: RunState },
}

impl RunStateData {
    pub fn new() -> Self {
        Self {
            state: RunState::Pending,
            updated_at: Utc::now(),
            seq: next_seq(),
        }
    }

    pub fn transition(&mut self, new_state: RunState) -> Result<(), RunStateError> {
        if !self.state.can_transition_to(new_state) {
            return Err(RunStateError::InvalidTransition {
                from: self.state,
                to: new_state,
            });
        }
        self.state = new_state;
        self.updated_at = Utc::now();
        self.seq = next_seq();
        Ok(())
    }
}

impl Default for RunStateData {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_path() {
        let mut data = RunStateData::new();
        data.transition(RunState::Starting).unwrap();
        data.transition(RunState::Running).unwrap();
        data.transition(RunState::Succeeded).unwrap();
        assert!(data.state.is_terminal());
    }

    #[test]
    fn test_kill_before_spawn() {
        let mut data = RunStateData::new();
        assert!(data.transition(RunState::Killed).is_ok());
        assert_eq!(data.state, RunState::Killed);
    }

    #[test]
    fn test_cannot_skip_running() {
        let mut data = RunStateData::new();
        data.transition(RunState::Starting).unwrap();
        assert!(data.transition(RunState::TimedOut).is_err());
        assert!(data.transition(RunState::Succeeded).is_err());
    }

    #[test]
    fn test_terminal_never_reenters_running() {
        for terminal in [
            RunState::Succeeded,
            RunState::Failed,
            RunState::Killed,
            RunState::TimedOut,
            RunState::Exception,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(RunState::Running));
            assert!(!terminal.can_transition_to(RunState::Pending));
        }
    }

    #[test]
    fn test_seq_increments() {
        let mut data = RunStateData::new();
        let before = data.seq;
        data.transition(RunState::Starting).unwrap();
        assert!(data.seq > before);
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&RunState::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
    }
}
