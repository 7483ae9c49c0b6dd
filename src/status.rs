//! Workflow status ledger
//!
//! One JSON object keyed by pipeline id, rewritten wholesale (write-then-rename)
//! on every transition. An existing file is merged on load so a restarted
//! engine keeps the history of the previous attempt.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::completion::lock;
use crate::state::{PipelineState, Reason};

/// Default status file name inside the campaign directory.
pub const STATUS_FILE_NAME: &str = "codar.workflow.status.json";

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("IO error on status file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("status file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type StatusResult<T> = Result<T, StatusError>;

/// One pipeline's entry in the status file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub state: PipelineState,
    #[serde(default)]
    pub reason: Option<Reason>,
    #[serde(default)]
    pub return_codes: BTreeMap<String, Option<i32>>,
}

impl StatusRecord {
    pub fn new(state: PipelineState) -> Self {
        Self {
            state,
            reason: None,
            return_codes: BTreeMap::new(),
        }
    }

    pub fn done(reason: Reason, return_codes: BTreeMap<String, Option<i32>>) -> Self {
        Self {
            state: PipelineState::Done,
            reason: Some(reason),
            return_codes,
        }
    }

    /// Rejected at admission: larger than the whole node budget.
    pub fn no_fit() -> Self {
        Self {
            state: PipelineState::NotStarted,
            reason: Some(Reason::NoFit),
            return_codes: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct WorkflowStatus {
    path: PathBuf,
    records: Mutex<BTreeMap<String, StatusRecord>>,
}

impl WorkflowStatus {
    /// Open the ledger at `path`, loading whatever a previous engine left.
    pub fn open(path: impl Into<PathBuf>) -> StatusResult<Self> {
        let path = path.into();
        let records = load(&path)?;
        if !records.is_empty() {
            tracing::info!(path = %path.display(), pipelines = records.len(), "loaded existing status file");
        }
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record `record` for `id` and rewrite the file.
    pub fn set_state(&self, id: &str, record: StatusRecord) -> StatusResult<()> {
        let mut records = lock(&self.records);
        tracing::debug!(pipeline = %id, state = record.state.as_str(), reason = ?record.reason, "status update");
        records.insert(id.to_string(), record);
        self.write(&records)
    }

    pub fn get(&self, id: &str) -> Option<StatusRecord> {
        lock(&self.records).get(id).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, StatusRecord> {
        lock(&self.records).clone()
    }

    /// Whether a previous attempt already finished `id`.
    pub fn is_done(&self, id: &str) -> bool {
        lock(&self.records)
            .get(id)
            .is_some_and(|r| r.state == PipelineState::Done)
    }

    fn write(&self, records: &BTreeMap<String, StatusRecord>) -> StatusResult<()> {
        let json = serde_json::to_string_pretty(records).map_err(|source| StatusError::Json {
            path: self.path.clone(),
            source,
        })?;
        let io_err = |source| StatusError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, json + "\n").map_err(io_err)?;
        fs::rename(&temp_path, &self.path).map_err(io_err)?;
        Ok(())
    }
}

fn load(path: &Path) -> StatusResult<BTreeMap<String, StatusRecord>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(source) => {
            return Err(StatusError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if text.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(&text).map_err(|source| StatusError::Json {
        path: path.to_path_buf(),
        source,
    })
}
