//! Pipeline-definition input format.
//!
//! The producer reads a JSON array of these. Keys the campaign
//! writer emits as `null` are accepted everywhere an optional value is.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use savanna_layout::NodeRecord;
use serde::{Deserialize, Deserializer, Serialize};

use crate::run::RunSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// One process per run.
    #[default]
    #[serde(alias = "DEFAULT", alias = "None", alias = "none")]
    Default,
    /// All runs as one multi-program job, when the launcher can.
    #[serde(alias = "MPMD")]
    Mpmd,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineDefinition {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub apps_dir: Option<PathBuf>,
    /// Lower bound on the pipeline's node cost.
    #[serde(default)]
    pub total_nodes: Option<u32>,
    #[serde(default)]
    pub node_layout: Option<Vec<NodeRecord>>,
    #[serde(default)]
    pub launch_mode: Option<LaunchMode>,
    #[serde(default)]
    pub kill_on_partial_failure: Option<bool>,
    #[serde(default)]
    pub post_process_script: Option<String>,
    #[serde(default)]
    pub post_process_args: Option<Vec<String>>,
    #[serde(default)]
    pub post_process_stop_on_failure: Option<bool>,
    pub runs: Vec<RunDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunDefinition {
    pub name: String,
    pub exe: String,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub nprocs: Option<u32>,
    /// Seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub after_rc_done: Option<String>,
    #[serde(default)]
    pub hostfile: Option<PathBuf>,
    #[serde(default)]
    pub sched_args: Option<BTreeMap<String, serde_json::Value>>,
    /// Seconds.
    #[serde(default)]
    pub sleep_after: Option<f64>,
    /// Relative paths resolve against the pipeline working dir.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub runner_override: Option<bool>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Str(String),
        Int(i64),
    }
    Ok(match Id::deserialize(deserializer)? {
        Id::Str(s) => s,
        Id::Int(i) => i.to_string(),
    })
}

/// Positive seconds as a duration. Anything else, including values too large
/// for a `Duration`, means "unset".
fn seconds(value: Option<f64>) -> Option<Duration> {
    value
        .filter(|s| *s > 0.0)
        .and_then(|s| Duration::try_from_secs_f64(s).ok())
}

impl RunDefinition {
    /// Runtime description for a run of a pipeline rooted at `pipeline_dir`.
    pub fn to_spec(&self, pipeline_dir: &Path, apps_dir: Option<&Path>) -> RunSpec {
        let working_dir = match &self.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => pipeline_dir.join(dir),
            None => pipeline_dir.to_path_buf(),
        };
        let sched_args = self
            .sched_args
            .iter()
            .flatten()
            .map(|(k, v)| {
                let v = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), v)
            })
            .collect();

        RunSpec {
            name: self.name.clone(),
            exe: self.exe.clone(),
            args: self.args.clone().unwrap_or_default(),
            env: self.env.clone().unwrap_or_default(),
            working_dir,
            nprocs: self.nprocs.unwrap_or(1),
            timeout: seconds(self.timeout),
            after: self.after_rc_done.clone(),
            sleep_after: seconds(self.sleep_after),
            hostfile: self.hostfile.clone(),
            sched_args,
            runner_override: self.runner_override.unwrap_or(false),
            apps_dir: apps_dir.map(Path::to_path_buf),
        }
    }
}

impl PipelineDefinition {
    pub fn run_specs(&self) -> Vec<RunSpec> {
        self.runs
            .iter()
            .map(|r| r.to_spec(&self.working_dir, self.apps_dir.as_deref()))
            .collect()
    }
}
