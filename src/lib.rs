//! Savanna - pipeline execution engine for HPC workflow campaigns
//!
//! Reads pipeline definitions, packs them onto a fixed allocation of compute
//! nodes, launches each run under an MPI launcher in its own process group,
//! and records every pipeline's outcome in a status file that survives
//! restarts.

#[cfg(not(unix))]
compile_error!("savanna manages POSIX process groups and only builds on unix");

pub mod completion;
pub mod config;
pub mod consumer;
pub mod launcher;
pub mod outputs;
pub mod pipeline;
pub mod process;
pub mod producer;
pub mod run;
pub mod scheduler;
pub mod signal;
pub mod state;
pub mod status;
pub mod timeout;

pub use config::{EffectiveConfig, EngineSettings};
pub use consumer::{Admission, AdmissionError, NodeId, PipelineRunner, RunnerOptions};
pub use launcher::{Launcher, LauncherKind};
pub use pipeline::{Pipeline, PipelineDefinition, PipelineError};
pub use producer::PipelineReader;
pub use run::{Run, RunReport, RunSpec};
pub use state::{PipelineState, Reason, RunState};
pub use status::{StatusRecord, WorkflowStatus};
pub use timeout::TerminationPolicy;
