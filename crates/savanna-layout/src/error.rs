//! Layout validation errors.

use thiserror::Error;

/// Result type for layout operations.
pub type LayoutResult<T> = Result<T, LayoutError>;

/// A node layout that cannot be honored.
///
/// Layout errors are raised at admission time and are never coerced into a
/// different layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("processes per node must be positive")]
    ZeroProcessesPerNode,

    #[error("run '{run}' requests zero processes")]
    ZeroProcesses { run: String },

    #[error("run '{run}' has zero ranks per node")]
    ZeroRanks { run: String },

    #[error("node record {record}: core {index} claimed by both '{first}' and '{second}'")]
    CoreConflict {
        record: usize,
        index: u32,
        first: String,
        second: String,
    },

    #[error("node record {record}: gpu {index} claimed by both '{first}' and '{second}'")]
    GpuConflict {
        record: usize,
        index: u32,
        first: String,
        second: String,
    },

    #[error("run '{run}' appears in node records {first} and {second}")]
    DuplicateRun {
        run: String,
        first: usize,
        second: usize,
    },

    #[error("run '{run}' has no matching node record")]
    MissingRun { run: String },

    #[error("node record {record} references unknown run '{run}'")]
    UnknownRun { record: usize, run: String },

    #[error("node record {record}: malformed rank reference '{value}'")]
    MalformedRank { record: usize, value: String },

    #[error("node record {record} places {processes} processes on nodes with {ppn} per node")]
    OverSubscribed { record: usize, processes: u64, ppn: u32 },
}
