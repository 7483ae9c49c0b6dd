//! Pipeline producer: reads pipeline definitions from a JSON file.
//!
//! Pipelines already recorded as `done` in the status file next to the
//! input are skipped, so a campaign can be restarted in place. A definition
//! that does not parse or validate is logged and skipped; the others still
//! run.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::pipeline::{Pipeline, PipelineDefinition};
use crate::state::PipelineState;
use crate::status::{StatusRecord, WorkflowStatus, STATUS_FILE_NAME};
use crate::timeout::TerminationPolicy;

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} must contain a JSON array of pipelines")]
    NotAnArray(PathBuf),
}

pub type ProducerResult<T> = Result<T, ProducerError>;

#[derive(Debug, Clone)]
pub struct PipelineReader {
    path: PathBuf,
    policy: TerminationPolicy,
    previous: Option<BTreeMap<String, StatusRecord>>,
}

impl PipelineReader {
    pub fn new(path: impl Into<PathBuf>, policy: TerminationPolicy) -> Self {
        Self {
            path: path.into(),
            policy,
            previous: None,
        }
    }

    /// Use `records` for the restart check instead of the status file that
    /// sits next to the input.
    pub fn with_previous_status(mut self, records: BTreeMap<String, StatusRecord>) -> Self {
        self.previous = Some(records);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the input and build every pipeline that still has to run.
    pub fn read_pipelines(&self) -> ProducerResult<Vec<Arc<Pipeline>>> {
        let text = fs::read_to_string(&self.path).map_err(|source| ProducerError::Io {
            path: self.path.clone(),
            source,
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|source| ProducerError::Json {
            path: self.path.clone(),
            source,
        })?;
        let Value::Array(entries) = value else {
            return Err(ProducerError::NotAnArray(self.path.clone()));
        };

        let previous = match &self.previous {
            Some(records) => records.clone(),
            None => self.sibling_status(),
        };

        let mut pipelines = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            let id = entry_id(&entry).unwrap_or_else(|| format!("#{index}"));
            if previous
                .get(&id)
                .is_some_and(|r| r.state == PipelineState::Done)
            {
                tracing::info!(pipeline = %id, "pipeline already done, skipping");
                continue;
            }

            let definition: PipelineDefinition = match serde_json::from_value(entry) {
                Ok(def) => def,
                Err(e) => {
                    tracing::error!(pipeline = %id, error = %e, "invalid pipeline definition, skipping");
                    continue;
                }
            };
            match Pipeline::from_definition(definition, self.policy) {
                Ok(pipeline) => {
                    tracing::debug!(pipeline = %id, runs = pipeline.runs().len(), "adding pipeline to run queue");
                    pipelines.push(pipeline);
                }
                Err(e) => tracing::error!(pipeline = %id, error = %e, "invalid pipeline, skipping"),
            }
        }
        Ok(pipelines)
    }

    fn sibling_status(&self) -> BTreeMap<String, StatusRecord> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        match WorkflowStatus::open(dir.join(STATUS_FILE_NAME)) {
            Ok(status) => status.snapshot(),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unreadable status file");
                BTreeMap::new()
            }
        }
    }
}

fn entry_id(entry: &Value) -> Option<String> {
    match entry.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
