//! Run and pipeline state machines
//!
//! - Run states: PENDING → STARTING → RUNNING → {SUCCEEDED | FAILED | KILLED | TIMED_OUT | EXCEPTION}
//! - Pipeline states: NOT_STARTED → RUNNING → {DONE | KILLED}

mod pipeline_state;
mod run_state;

pub use pipeline_state::{PipelineState, PipelineStateError, Reason};
pub use run_state::{RunState, RunStateData, RunStateError};

use std::sync::atomic::{AtomicU64, Ordering};

/// Global sequence counter for ordering transitions across threads
static SEQUENCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Get the next sequence number for ordering
pub fn next_seq() -> u64 {
    SEQUENCE_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Check if a state is terminal (no further transitions possible)
pub trait TerminalState {
    fn is_terminal(&self) -> bool;
}
