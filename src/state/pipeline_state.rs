//! Pipeline state machine and terminal reasons
//!
//! NOT_STARTED → RUNNING → DONE, with KILLED reachable from NOT_STARTED and
//! RUNNING. The names serialize exactly as they appear in the status file.

use serde::{Deserialize, Serialize};

use super::TerminalState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    NotStarted,
    Running,
    Done,
    Killed,
}

impl TerminalState for PipelineState {
    fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Killed)
    }
}

impl PipelineState {
    pub fn can_transition_to(&self, target: PipelineState) -> bool {
        matches!(
            (self, target),
            (PipelineState::NotStarted, PipelineState::Running)
                | (PipelineState::NotStarted, PipelineState::Killed)
                | (PipelineState::Running, PipelineState::Done)
                | (PipelineState::Running, PipelineState::Killed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::NotStarted => "not_started",
            PipelineState::Running => "running",
            PipelineState::Done => "done",
            PipelineState::Killed => "killed",
        }
    }
}

/// Why a pipeline ended up in its recorded state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reason {
    Succeeded,
    Failed,
    Timeout,
    Exception,
    /// Needs more nodes than the whole budget; never queued.
    #[serde(rename = "nofit")]
    NoFit,
}

impl Reason {
    /// Collapse per-run reasons, preferring exception, then timeout, then
    /// failed.
    pub fn worst<I: IntoIterator<Item = Reason>>(reasons: I) -> Reason {
        reasons
            .into_iter()
            .max_by_key(|r| r.priority())
            .unwrap_or(Reason::Succeeded)
    }

    fn priority(&self) -> u8 {
        match self {
            Reason::Succeeded => 0,
            Reason::Failed => 1,
            Reason::Timeout => 2,
            Reason::Exception => 3,
            Reason::NoFit => 4,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineStateError {
    #[error("Invalid pipeline transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },
}
