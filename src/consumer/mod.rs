//! Pipeline consumer: admits pipelines and runs them within a node budget.
//!
//! Pipelines may be added from any thread. The scheduling loop runs on one
//! dedicated thread and starts the costliest queued pipeline that fits in the
//! free nodes; nodes come back when a pipeline reports completion. `stop` and
//! `kill_all` may be called from any thread, including pipeline threads.

pub mod nodes;

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::completion::lock;
use crate::launcher::Launcher;
use crate::outputs::write_inventory;
use crate::pipeline::{Pipeline, PipelineError, PipelineObserver};
use crate::scheduler::{JobList, JobListError};
use crate::state::{PipelineState, Reason};
use crate::status::{StatusRecord, WorkflowStatus};

pub use nodes::{NodeId, NodePool};

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("new pipelines are not allowed after stop or kill")]
    Stopped,

    #[error("duplicate pipeline id: {0}")]
    Duplicate(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

pub type AdmissionResult<T> = Result<T, AdmissionError>;

/// What happened to an admitted pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued { cost: u32 },
    /// Needs more nodes than the runner has; recorded and dropped.
    NoFit { cost: u32 },
}

pub struct RunnerOptions {
    pub max_nodes: u32,
    pub processes_per_node: u32,
    pub launcher: Arc<dyn Launcher>,
    pub status: Option<Arc<WorkflowStatus>>,
    /// Escalate a pipeline-fatal post-process failure to `kill_all`.
    pub kill_all_on_fatal: bool,
}

#[derive(Debug)]
struct Registry {
    allow_new: bool,
    process: bool,
    killed: bool,
    ids: BTreeSet<String>,
    running: BTreeMap<String, Arc<Pipeline>>,
    started: Vec<Arc<Pipeline>>,
}

struct RunnerCore {
    max_nodes: u32,
    ppn: u32,
    launcher: Arc<dyn Launcher>,
    status: Option<Arc<WorkflowStatus>>,
    kill_all_on_fatal: bool,
    pool: NodePool,
    jobs: JobList<Arc<Pipeline>>,
    registry: Mutex<Registry>,
    jobs_ready: Condvar,
}

/// Runs pipelines on a homogeneous set of `max_nodes` nodes.
#[derive(Clone)]
pub struct PipelineRunner {
    core: Arc<RunnerCore>,
}

impl std::fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("max_nodes", &self.core.max_nodes)
            .field("processes_per_node", &self.core.ppn)
            .field("launcher", &self.core.launcher.kind())
            .finish()
    }
}

impl PipelineRunner {
    pub fn new(options: RunnerOptions) -> Self {
        Self {
            core: Arc::new(RunnerCore {
                max_nodes: options.max_nodes,
                ppn: options.processes_per_node,
                launcher: options.launcher,
                status: options.status,
                kill_all_on_fatal: options.kill_all_on_fatal,
                pool: NodePool::new(options.max_nodes),
                jobs: JobList::new(),
                registry: Mutex::new(Registry {
                    allow_new: true,
                    process: true,
                    killed: false,
                    ids: BTreeSet::new(),
                    running: BTreeMap::new(),
                    started: Vec::new(),
                }),
                jobs_ready: Condvar::new(),
            }),
        }
    }

    /// Resolve, cost and queue `pipeline`.
    pub fn add_pipeline(&self, pipeline: Arc<Pipeline>) -> AdmissionResult<Admission> {
        self.core.add_pipeline(pipeline)
    }

    /// Scheduling loop. Returns after `stop` once every admitted pipeline has
    /// finished, or after `kill_all` once running pipelines are joined.
    pub fn run(&self) {
        Arc::clone(&self.core).run();
    }

    /// Run the scheduling loop on its own thread.
    pub fn spawn(&self) -> io::Result<JoinHandle<()>> {
        let core = Arc::clone(&self.core);
        thread::Builder::new()
            .name("savanna-scheduler".to_string())
            .spawn(move || core.run())
    }

    /// Refuse new pipelines and finish once the queue drains.
    pub fn stop(&self) {
        self.core.stop();
    }

    /// Refuse new pipelines, start nothing more, and kill what is running.
    pub fn kill_all(&self) {
        self.core.kill_all();
    }

    pub fn is_killed(&self) -> bool {
        lock(&self.core.registry).killed
    }

    pub fn free_nodes(&self) -> u32 {
        self.core.pool.free()
    }

    pub fn queued(&self) -> usize {
        self.core.jobs.len()
    }

    /// Ids of pipelines currently holding nodes.
    pub fn running(&self) -> Vec<String> {
        lock(&self.core.registry).running.keys().cloned().collect()
    }

    pub fn status(&self) -> Option<&Arc<WorkflowStatus>> {
        self.core.status.as_ref()
    }
}

impl RunnerCore {
    fn record(&self, id: &str, record: StatusRecord) {
        if let Some(status) = &self.status {
            if let Err(e) = status.set_state(id, record) {
                tracing::error!(pipeline = %id, error = %e, "could not write status file");
            }
        }
    }

    fn add_pipeline(&self, pipeline: Arc<Pipeline>) -> AdmissionResult<Admission> {
        let mut registry = lock(&self.registry);
        if !registry.allow_new {
            return Err(AdmissionError::Stopped);
        }
        let id = pipeline.id().to_string();
        if !registry.ids.insert(id.clone()) {
            return Err(AdmissionError::Duplicate(id));
        }

        let cost = match pipeline.resolve_layout(self.ppn) {
            Ok(cost) => cost,
            Err(e) => {
                tracing::error!(pipeline = %id, error = %e, "could not resolve node layout");
                return Err(e.into());
            }
        };
        if cost > self.max_nodes {
            tracing::error!(
                pipeline = %id,
                cost,
                max_nodes = self.max_nodes,
                "pipeline needs more nodes than available, skipping"
            );
            self.record(&id, StatusRecord::no_fit());
            return Ok(Admission::NoFit { cost });
        }

        self.record(&id, pipeline.get_state());
        self.jobs.add_job(pipeline, cost);
        tracing::debug!(pipeline = %id, cost, queued = self.jobs.len(), "pipeline queued");
        self.jobs_ready.notify_all();
        // A smaller job may fit where the waiting one did not.
        self.pool.notify();
        Ok(Admission::Queued { cost })
    }

    fn stop(&self) {
        lock(&self.registry).allow_new = false;
        tracing::info!("runner stopping once queued pipelines finish");
        self.jobs_ready.notify_all();
    }

    fn kill_all(&self) {
        let still_running: Vec<Arc<Pipeline>> = {
            let mut registry = lock(&self.registry);
            registry.killed = true;
            registry.allow_new = false;
            registry.process = false;
            registry.running.values().cloned().collect()
        };
        tracing::warn!(running = still_running.len(), "killing all pipelines");
        self.pool.halt();
        self.jobs_ready.notify_all();

        for pipeline in still_running {
            self.pool.give_back(pipeline.take_nodes());
            pipeline.force_kill_all();
            tracing::debug!(pipeline = %pipeline.id(), free = self.pool.free(), "pipeline killed");
        }
    }

    fn run(self: Arc<Self>) {
        loop {
            {
                let mut registry = lock(&self.registry);
                while self.jobs.is_empty() && registry.allow_new && registry.process {
                    registry = self
                        .jobs_ready
                        .wait(registry)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                if !registry.process || self.jobs.is_empty() {
                    break;
                }
            }

            let picked = self.pool.take_when(|free| match self.jobs.pop_job(free) {
                Ok(job) => job.map(|(pipeline, cost)| ((pipeline, cost), cost)),
                Err(JobListError::Empty) => None,
            });
            let Some(((pipeline, cost), nodes)) = picked else {
                break;
            };

            {
                let mut registry = lock(&self.registry);
                if !registry.process {
                    drop(registry);
                    self.pool.give_back(nodes);
                    break;
                }
                registry.running.insert(pipeline.id().to_string(), Arc::clone(&pipeline));
                registry.started.push(Arc::clone(&pipeline));
                self.record(pipeline.id(), StatusRecord::new(PipelineState::Running));
            }
            tracing::debug!(
                pipeline = %pipeline.id(),
                cost,
                free = self.pool.free(),
                nodes = ?nodes,
                "starting pipeline"
            );

            let observer: Arc<dyn PipelineObserver> = Arc::clone(&self) as Arc<dyn PipelineObserver>;
            if let Err(e) = pipeline.start(nodes.clone(), self.launcher.as_ref(), observer) {
                tracing::error!(pipeline = %pipeline.id(), error = %e, "could not start pipeline");
                self.pool.give_back(nodes);
                let mut registry = lock(&self.registry);
                registry.running.remove(pipeline.id());
                self.record(
                    pipeline.id(),
                    StatusRecord {
                        state: PipelineState::Done,
                        reason: Some(Reason::Exception),
                        return_codes: BTreeMap::new(),
                    },
                );
            }
        }
        self.join_started();
    }

    /// Wait for every started pipeline. Must run without locks held, since
    /// pipeline threads call back into the runner.
    fn join_started(&self) {
        let started: Vec<Arc<Pipeline>> = lock(&self.registry).started.clone();
        for pipeline in started {
            pipeline.join();
        }
        tracing::info!("scheduler finished");
    }
}

impl PipelineObserver for RunnerCore {
    fn pipeline_finished(&self, pipeline: &Arc<Pipeline>) {
        match write_inventory(pipeline.working_dir()) {
            Ok(inventory) => tracing::debug!(
                pipeline = %pipeline.id(),
                outputs = inventory.sizes.len(),
                "output inventory written"
            ),
            Err(e) => tracing::warn!(pipeline = %pipeline.id(), error = %e, "could not write output inventory"),
        }

        let nodes = pipeline.take_nodes();
        let returned = nodes.len();
        self.pool.give_back(nodes);
        tracing::debug!(pipeline = %pipeline.id(), returned, free = self.pool.free(), "pipeline finished");

        let mut registry = lock(&self.registry);
        registry.running.remove(pipeline.id());
        self.record(pipeline.id(), pipeline.get_state());
    }

    fn pipeline_fatal(&self, pipeline: &Arc<Pipeline>) {
        tracing::error!(pipeline = %pipeline.id(), "fatal error in pipeline");
        if self.kill_all_on_fatal {
            self.kill_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::DirectLauncher;
    use crate::pipeline::PipelineOptions;
    use crate::run::RunSpec;
    use crate::timeout::TerminationPolicy;
    use savanna_layout::NodeRecord;
    use tempfile::TempDir;

    fn runner(max_nodes: u32, status: Option<Arc<WorkflowStatus>>) -> PipelineRunner {
        PipelineRunner::new(RunnerOptions {
            max_nodes,
            processes_per_node: 4,
            launcher: Arc::new(DirectLauncher),
            status,
            kill_all_on_fatal: false,
        })
    }

    fn pipeline(dir: &TempDir, id: &str, nprocs: u32) -> Arc<Pipeline> {
        let mut spec = RunSpec::new("a", "/bin/true", dir.path().join(id));
        spec.nprocs = nprocs;
        Pipeline::new(
            id,
            dir.path().join(id),
            vec![spec],
            PipelineOptions::default(),
            TerminationPolicy::quick(),
        )
        .unwrap()
    }

    #[test]
    fn test_nofit_is_recorded_not_queued() {
        let dir = TempDir::new().unwrap();
        let status = Arc::new(WorkflowStatus::open(dir.path().join("status.json")).unwrap());
        let runner = runner(2, Some(Arc::clone(&status)));

        let admission = runner.add_pipeline(pipeline(&dir, "huge", 12)).unwrap();
        assert_eq!(admission, Admission::NoFit { cost: 3 });
        assert_eq!(runner.queued(), 0);
        assert_eq!(status.get("huge"), Some(StatusRecord::no_fit()));
    }

    #[test]
    fn test_queued_is_recorded_not_started() {
        let dir = TempDir::new().unwrap();
        let status = Arc::new(WorkflowStatus::open(dir.path().join("status.json")).unwrap());
        let runner = runner(2, Some(Arc::clone(&status)));

        assert_eq!(
            runner.add_pipeline(pipeline(&dir, "p", 4)).unwrap(),
            Admission::Queued { cost: 1 }
        );
        assert_eq!(runner.queued(), 1);
        assert_eq!(status.get("p").unwrap().state, PipelineState::NotStarted);
    }

    #[test]
    fn test_duplicate_and_stopped_rejected() {
        let dir = TempDir::new().unwrap();
        let runner = runner(2, None);
        runner.add_pipeline(pipeline(&dir, "p", 1)).unwrap();
        assert!(matches!(
            runner.add_pipeline(pipeline(&dir, "p", 1)),
            Err(AdmissionError::Duplicate(_))
        ));
        runner.stop();
        assert!(matches!(
            runner.add_pipeline(pipeline(&dir, "q", 1)),
            Err(AdmissionError::Stopped)
        ));
    }

    #[test]
    fn test_layout_error_rejects() {
        let dir = TempDir::new().unwrap();
        let runner = runner(2, None);
        let bad = Pipeline::new(
            "bad",
            dir.path(),
            vec![RunSpec::new("a", "/bin/true", dir.path())],
            PipelineOptions {
                node_layout: Some(vec![serde_json::from_value::<NodeRecord>(
                    serde_json::json!({"ghost": 1}),
                )
                .unwrap()]),
                ..PipelineOptions::default()
            },
            TerminationPolicy::quick(),
        )
        .unwrap();
        assert!(matches!(
            runner.add_pipeline(bad),
            Err(AdmissionError::Pipeline(PipelineError::Layout(_)))
        ));
        assert_eq!(runner.queued(), 0);
    }

    #[test]
    fn test_run_returns_after_stop() {
        let dir = TempDir::new().unwrap();
        let runner = runner(2, None);
        for id in ["x", "y", "z"] {
            runner.add_pipeline(pipeline(&dir, id, 4)).unwrap();
        }
        let handle = runner.spawn().unwrap();
        runner.stop();
        handle.join().unwrap();

        assert_eq!(runner.queued(), 0);
        assert!(runner.running().is_empty());
        assert_eq!(runner.free_nodes(), 2);
    }

    #[test]
    fn test_run_inline_drains_queue() {
        let dir = TempDir::new().unwrap();
        let status = Arc::new(WorkflowStatus::open(dir.path().join("status.json")).unwrap());
        let runner = runner(1, Some(Arc::clone(&status)));
        for id in ["x", "y"] {
            runner.add_pipeline(pipeline(&dir, id, 2)).unwrap();
        }
        runner.stop();
        runner.run();

        assert_eq!(runner.queued(), 0);
        assert_eq!(runner.free_nodes(), 1);
        for id in ["x", "y"] {
            assert_eq!(status.get(id).unwrap().state, PipelineState::Done);
        }
    }
}
