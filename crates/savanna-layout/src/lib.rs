//! Node layout resolution for Savanna pipelines.
//!
//! A pipeline's `node_layout` says which runs share a compute node and how
//! many ranks (or which cores and GPUs) each gets there. [`resolve`] turns
//! that description plus the pipeline's runs into per-run node counts and
//! groups of runs that share nodes, and fails with [`LayoutError`] when the
//! description cannot be honored.

pub mod error;
pub mod record;
pub mod resolve;

pub use error::{LayoutError, LayoutResult};
pub use record::{CoreClaim, NodeRecord, RankRef, ResourceRecord, RunClaims};
pub use resolve::{resolve, Group, NodeConfig, ResolvedLayout, RunPlacement, RunRequest};
