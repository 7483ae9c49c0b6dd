//! Pipeline orchestration
//!
//! A pipeline is a set of runs sharing one node allocation:
//! - Validate the definition and order runs so each follows its predecessor
//! - Resolve the node layout once, which fixes the node cost
//! - On start, place runs on the granted nodes and build their command lines
//! - Launch runs from a management thread and aggregate their completions
//! - Save the total walltime and fire the post-process hook at the end
//!
//! Runs report back over a channel drained by the management thread; the
//! owner of the pipeline hears about completion through [`PipelineObserver`].

pub mod definition;
pub mod order;
pub mod post_process;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use savanna_layout::{resolve, LayoutError, NodeRecord, ResolvedLayout, RunRequest};
use thiserror::Error;

use crate::completion::{lock, Completion};
use crate::consumer::NodeId;
use crate::launcher::{LaunchRequest, Launcher};
use crate::run::artifacts::{write_seconds, TOTAL_WALLTIME_NAME};
use crate::run::{Placement, Run, RunReport, RunSpec};
use crate::state::{PipelineState, PipelineStateError, Reason};
use crate::status::StatusRecord;
use crate::timeout::TerminationPolicy;

pub use definition::{LaunchMode, PipelineDefinition, RunDefinition};
pub use order::launch_order;
pub use post_process::{PostProcess, POST_PROCESS_NAME};

/// Name of the joint run when a pipeline is launched as one MPMD job.
pub const MPMD_RUN_NAME: &str = "mpmd";

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("layout error: {0}")]
    Layout(#[from] LayoutError),

    #[error("pipeline '{pipeline}' has a dependency cycle among runs {runs:?}")]
    CyclicDependency { pipeline: String, runs: Vec<String> },

    #[error("run '{run}' in pipeline '{pipeline}' waits on unknown run '{after}'")]
    UnknownPredecessor {
        pipeline: String,
        run: String,
        after: String,
    },

    #[error("pipeline '{pipeline}' defines run '{run}' twice")]
    DuplicateRun { pipeline: String, run: String },

    #[error("pipeline '{0}' has no runs")]
    Empty(String),

    #[error("pipeline '{0}' was started twice")]
    AlreadyStarted(String),

    #[error("pipeline '{0}' was started before its layout was resolved")]
    Unresolved(String),

    #[error("pipeline '{pipeline}' needs {need} nodes but was given {got}")]
    InsufficientNodes { pipeline: String, need: u32, got: u32 },

    #[error(transparent)]
    State(#[from] PipelineStateError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Told about pipeline-level events. Called from pipeline threads, never
/// while a pipeline lock is held.
pub trait PipelineObserver: Send + Sync {
    /// Every run has finished. Called exactly once per started pipeline.
    fn pipeline_finished(&self, pipeline: &Arc<Pipeline>);

    /// The post-process hook failed and asked for the campaign to stop.
    fn pipeline_fatal(&self, pipeline: &Arc<Pipeline>);
}

/// Pipeline-wide settings besides the runs themselves.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Lower bound on the node cost.
    pub total_nodes: Option<u32>,
    pub node_layout: Option<Vec<NodeRecord>>,
    pub launch_mode: LaunchMode,
    pub kill_on_partial_failure: bool,
    pub post_process: Option<PostProcess>,
}

struct Inner {
    state: PipelineState,
    force_killed: bool,
    active: BTreeSet<String>,
    /// Runs actually launched: the pipeline's runs, or the one MPMD run.
    launched: Vec<Arc<Run>>,
    nodes: Vec<NodeId>,
    started_at: Option<Instant>,
    observer: Option<Arc<dyn PipelineObserver>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: PipelineState::NotStarted,
            force_killed: false,
            active: BTreeSet::new(),
            launched: Vec::new(),
            nodes: Vec::new(),
            started_at: None,
            observer: None,
        }
    }

    fn transition(&mut self, to: PipelineState) -> Result<(), PipelineStateError> {
        if !self.state.can_transition_to(to) {
            return Err(PipelineStateError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

pub struct Pipeline {
    id: String,
    working_dir: PathBuf,
    options: PipelineOptions,
    /// In launch order.
    runs: Vec<Arc<Run>>,
    policy: TerminationPolicy,
    layout: OnceLock<ResolvedLayout>,
    inner: Mutex<Inner>,
    all_launched: Completion<()>,
    finished: Completion<StatusRecord>,
    manager: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("working_dir", &self.working_dir)
            .field("runs", &self.runs)
            .finish()
    }
}

impl Pipeline {
    /// Validate `runs` and order them for launch.
    pub fn new(
        id: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        runs: Vec<RunSpec>,
        options: PipelineOptions,
        policy: TerminationPolicy,
    ) -> PipelineResult<Arc<Self>> {
        let id = id.into();
        if runs.is_empty() {
            return Err(PipelineError::Empty(id));
        }

        let order = {
            let mut names = BTreeSet::new();
            for spec in &runs {
                if !names.insert(spec.name.as_str()) {
                    return Err(PipelineError::DuplicateRun {
                        pipeline: id,
                        run: spec.name.clone(),
                    });
                }
            }
            for spec in &runs {
                if let Some(after) = spec.after.as_deref().filter(|a| !names.contains(a)) {
                    return Err(PipelineError::UnknownPredecessor {
                        pipeline: id,
                        run: spec.name.clone(),
                        after: after.to_string(),
                    });
                }
            }
            let edges: Vec<(&str, Option<&str>)> = runs
                .iter()
                .map(|s| (s.name.as_str(), s.after.as_deref()))
                .collect();
            launch_order(&edges).map_err(|cycle| PipelineError::CyclicDependency {
                pipeline: id.clone(),
                runs: cycle,
            })?
        };

        let mut slots: Vec<Option<RunSpec>> = runs.into_iter().map(Some).collect();
        let mut by_name: BTreeMap<String, Arc<Run>> = BTreeMap::new();
        let mut ordered = Vec::with_capacity(order.len());
        for idx in order {
            let Some(spec) = slots.get_mut(idx).and_then(Option::take) else {
                continue;
            };
            let predecessor = spec.after.as_ref().and_then(|a| by_name.get(a)).cloned();
            let run = Run::new(spec, predecessor.as_ref(), policy);
            by_name.insert(run.name().to_string(), Arc::clone(&run));
            ordered.push(run);
        }

        Ok(Arc::new(Self {
            id,
            working_dir: working_dir.into(),
            options,
            runs: ordered,
            policy,
            layout: OnceLock::new(),
            inner: Mutex::new(Inner::new()),
            all_launched: Completion::new(),
            finished: Completion::new(),
            manager: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }))
    }

    pub fn from_definition(def: PipelineDefinition, policy: TerminationPolicy) -> PipelineResult<Arc<Self>> {
        let runs = def.run_specs();
        let post_process = def.post_process_script.map(|script| PostProcess {
            script,
            args: def.post_process_args.unwrap_or_default(),
            stop_on_failure: def.post_process_stop_on_failure.unwrap_or(false),
        });
        let options = PipelineOptions {
            total_nodes: def.total_nodes,
            node_layout: def.node_layout,
            launch_mode: def.launch_mode.unwrap_or_default(),
            kill_on_partial_failure: def.kill_on_partial_failure.unwrap_or(false),
            post_process,
        };
        Self::new(def.id, def.working_dir, runs, options, policy)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Runs in launch order.
    pub fn runs(&self) -> &[Arc<Run>] {
        &self.runs
    }

    pub fn run(&self, name: &str) -> Option<&Arc<Run>> {
        self.runs.iter().find(|r| r.name() == name)
    }

    /// Runs started by `start`; empty before that.
    pub fn launched_runs(&self) -> Vec<Arc<Run>> {
        lock(&self.inner).launched.clone()
    }

    /// Node ids held since `start`.
    pub fn nodes(&self) -> Vec<NodeId> {
        lock(&self.inner).nodes.clone()
    }

    /// Hand back the node ids; later calls get nothing.
    pub fn take_nodes(&self) -> Vec<NodeId> {
        std::mem::take(&mut lock(&self.inner).nodes)
    }

    pub fn layout(&self) -> Option<&ResolvedLayout> {
        self.layout.get()
    }

    pub fn is_force_killed(&self) -> bool {
        lock(&self.inner).force_killed
    }

    /// Resolve the node layout and return the node cost.
    ///
    /// Resolution happens once; later calls return the same cost whatever
    /// `processes_per_node` they pass.
    pub fn resolve_layout(&self, processes_per_node: u32) -> PipelineResult<u32> {
        if let Some(layout) = self.layout.get() {
            return Ok(self.cost_of(layout));
        }
        let requests: Vec<RunRequest> = self
            .runs
            .iter()
            .map(|run| {
                let request = RunRequest::new(run.name(), run.spec().nprocs);
                match &run.spec().after {
                    Some(after) => request.after(after.clone()),
                    None => request,
                }
            })
            .collect();
        let resolved = resolve(self.options.node_layout.as_deref(), &requests, processes_per_node)?;
        let layout = self.layout.get_or_init(|| resolved);
        let cost = self.cost_of(layout);
        tracing::debug!(pipeline = %self.id, cost, groups = layout.groups.len(), "layout resolved");
        Ok(cost)
    }

    /// Node cost, once the layout is resolved.
    pub fn node_cost(&self) -> Option<u32> {
        self.layout.get().map(|layout| self.cost_of(layout))
    }

    fn cost_of(&self, layout: &ResolvedLayout) -> u32 {
        layout.total_nodes().max(self.options.total_nodes.unwrap_or(0))
    }

    /// Place runs on `nodes` and launch them from a management thread.
    ///
    /// Returns once the thread is running. The caller must not hold any lock
    /// that `observer` takes.
    pub fn start(
        self: &Arc<Self>,
        nodes: Vec<NodeId>,
        launcher: &dyn Launcher,
        observer: Arc<dyn PipelineObserver>,
    ) -> PipelineResult<()> {
        let layout = self
            .layout
            .get()
            .ok_or_else(|| PipelineError::Unresolved(self.id.clone()))?;
        let need = self.cost_of(layout);
        if (nodes.len() as u32) < need {
            return Err(PipelineError::InsufficientNodes {
                pipeline: self.id.clone(),
                need,
                got: nodes.len() as u32,
            });
        }

        let launched = {
            let mut inner = lock(&self.inner);
            if inner.state != PipelineState::NotStarted {
                return Err(PipelineError::AlreadyStarted(self.id.clone()));
            }
            inner.transition(PipelineState::Running)?;

            self.assign_nodes(layout, &nodes);
            let launched = self.prepare_commands(launcher, &nodes);
            if let Err(e) = fs::create_dir_all(&self.working_dir) {
                tracing::warn!(pipeline = %self.id, error = %e, "could not create working dir");
            }

            inner.active = launched.iter().map(|r| r.name().to_string()).collect();
            inner.launched = launched.clone();
            inner.nodes = nodes;
            inner.started_at = Some(Instant::now());
            inner.observer = Some(observer);
            launched
        };
        tracing::info!(
            pipeline = %self.id,
            runs = launched.len(),
            nodes = need,
            "pipeline started"
        );

        let pipeline = Arc::clone(self);
        let to_launch = launched.clone();
        let spawned = thread::Builder::new()
            .name(format!("pipeline-{}", self.id))
            .spawn(move || pipeline.manage(to_launch));
        match spawned {
            Ok(handle) => *lock(&self.manager) = Some(handle),
            Err(e) => {
                tracing::error!(pipeline = %self.id, error = %e, "could not start management thread");
                self.all_launched.complete(());
                for run in &launched {
                    let report = run.fail_unstarted();
                    self.run_finished(&report);
                }
            }
        }
        Ok(())
    }

    fn assign_nodes(&self, layout: &ResolvedLayout, nodes: &[NodeId]) {
        let mut cursor = 0;
        let mut group_nodes = Vec::with_capacity(layout.groups.len());
        for group in &layout.groups {
            let end = (cursor + group.nodes as usize).min(nodes.len());
            group_nodes.push(&nodes[cursor..end]);
            cursor = end;
        }
        for run in &self.runs {
            let Some(placed) = layout.placement(run.name()) else {
                tracing::warn!(pipeline = %self.id, run = %run.name(), "run missing from layout");
                continue;
            };
            let pool = group_nodes.get(placed.group).copied().unwrap_or_default();
            let take = (placed.nodes as usize).min(pool.len());
            run.set_placement(Placement {
                nodes: pool[..take].to_vec(),
                tasks_per_node: placed.tasks_per_node,
                node_config: placed.node_config.clone(),
            });
        }
    }

    /// Set every run's argv and return the runs to launch.
    fn prepare_commands(&self, launcher: &dyn Launcher, nodes: &[NodeId]) -> Vec<Arc<Run>> {
        if self.options.launch_mode == LaunchMode::Mpmd {
            if let Some(run) = self.mpmd_run(launcher, nodes) {
                return vec![run];
            }
        }
        for run in &self.runs {
            if run.spec().runner_override {
                continue;
            }
            match launcher.wrap(&launch_request(run)) {
                Ok(argv) => run.set_command(argv),
                Err(e) => {
                    tracing::error!(pipeline = %self.id, run = %run.name(), error = %e, "launcher failed");
                    run.set_launch_error(e.to_string());
                }
            }
        }
        self.runs.clone()
    }

    /// One joint run, or `None` to fall back to separate processes.
    fn mpmd_run(&self, launcher: &dyn Launcher, nodes: &[NodeId]) -> Option<Arc<Run>> {
        if self.runs.len() < 2 {
            return None;
        }
        if self
            .runs
            .iter()
            .any(|r| r.spec().after.is_some() || r.spec().runner_override)
        {
            tracing::warn!(pipeline = %self.id, "MPMD needs independent launcher-started runs, launching separately");
            return None;
        }
        let requests: Vec<LaunchRequest<'_>> = self.runs.iter().map(|r| launch_request(r)).collect();
        let argv = match launcher.wrap_mpmd(&requests) {
            Some(Ok(argv)) => argv,
            Some(Err(e)) => {
                tracing::warn!(pipeline = %self.id, error = %e, "MPMD launch failed, launching separately");
                return None;
            }
            None => {
                tracing::info!(pipeline = %self.id, launcher = %launcher.kind(), "launcher has no MPMD mode, launching separately");
                return None;
            }
        };
        let (program, args) = argv.split_first()?;

        let first = self.runs[0].spec();
        let mut spec = RunSpec::new(MPMD_RUN_NAME, program.clone(), self.working_dir.clone())
            .with_args(args.iter().cloned());
        spec.nprocs = self.runs.iter().map(|r| r.spec().nprocs).sum();
        spec.timeout = first.timeout;
        spec.apps_dir = first.apps_dir.clone();
        spec.runner_override = true;
        // one process environment for every rank; later runs win on a clash
        for run in &self.runs {
            for (key, value) in &run.spec().env {
                if let Some(previous) = spec.env.insert(key.clone(), value.clone()) {
                    if previous != *value {
                        tracing::warn!(
                            pipeline = %self.id,
                            run = %run.name(),
                            var = %key,
                            "MPMD environment variable overrides an earlier run's value"
                        );
                    }
                }
            }
        }

        let run = Run::new(spec, None, self.policy);
        run.set_placement(Placement {
            nodes: nodes.to_vec(),
            tasks_per_node: requests.iter().map(|r| r.tasks_per_node).max().unwrap_or(1),
            node_config: None,
        });
        run.set_command(argv.clone());
        tracing::info!(pipeline = %self.id, runs = self.runs.len(), "launching as one MPMD job");
        Some(run)
    }

    /// Management thread body: launch in order, then aggregate completions.
    fn manage(self: Arc<Self>, runs: Vec<Arc<Run>>) {
        let (tx, rx) = unbounded();
        let mut handles = Vec::with_capacity(runs.len());
        for run in &runs {
            match run.start(tx.clone()) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    tracing::error!(pipeline = %self.id, run = %run.name(), error = %e, "could not start run");
                    let report = run.fail_unstarted();
                    self.run_finished(&report);
                    continue;
                }
            }
            if let Some(pause) = run.spec().sleep_after {
                thread::sleep(pause);
            }
        }
        drop(tx);
        let pending = handles.len();
        lock(&self.workers).extend(handles);
        self.all_launched.complete(());

        for report in rx.iter().take(pending) {
            self.run_finished(&report);
        }
    }

    /// Account for one finished run.
    fn run_finished(self: &Arc<Self>, report: &RunReport) {
        let mut inner = lock(&self.inner);
        if !inner.active.remove(&report.name) {
            tracing::warn!(pipeline = %self.id, run = %report.name, "completion for a run that is not active");
            return;
        }

        if !inner.active.is_empty() {
            if self.options.kill_on_partial_failure && !report.succeeded() {
                let victims: Vec<Arc<Run>> = inner
                    .launched
                    .iter()
                    .filter(|r| inner.active.contains(r.name()))
                    .cloned()
                    .collect();
                drop(inner);
                tracing::warn!(
                    pipeline = %self.id,
                    run = %report.name,
                    state = ?report.state,
                    "run did not succeed, killing the rest of the pipeline"
                );
                for victim in victims {
                    victim.kill();
                }
            }
            return;
        }

        let force_killed = inner.force_killed;
        if !force_killed {
            if let Err(e) = inner.transition(PipelineState::Done) {
                tracing::error!(pipeline = %self.id, error = %e, "unexpected pipeline state");
            }
        }
        let elapsed = inner.started_at.map(|t| t.elapsed()).unwrap_or_default();
        let observer = inner.observer.take();
        drop(inner);

        self.save_walltime(elapsed);
        if !force_killed {
            self.spawn_post_process(observer.clone());
        }

        let status = self.get_state();
        tracing::info!(
            pipeline = %self.id,
            state = status.state.as_str(),
            reason = ?status.reason,
            walltime_s = elapsed.as_secs_f64(),
            "pipeline finished"
        );
        self.finished.complete(status);
        if let Some(observer) = observer {
            observer.pipeline_finished(self);
        }
    }

    fn save_walltime(&self, elapsed: Duration) {
        let path = self.working_dir.join(TOTAL_WALLTIME_NAME);
        if let Err(e) = write_seconds(&path, elapsed) {
            tracing::warn!(pipeline = %self.id, error = %e, "could not save pipeline walltime");
        }
    }

    fn spawn_post_process(self: &Arc<Self>, observer: Option<Arc<dyn PipelineObserver>>) {
        let Some(hook) = self.options.post_process.clone() else {
            return;
        };
        let pipeline = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("post-{}", self.id))
            .spawn(move || {
                let rval = hook.execute(&pipeline.id, &pipeline.working_dir, &pipeline.policy);
                if rval != Some(0) && hook.stop_on_failure {
                    tracing::error!(pipeline = %pipeline.id, rval = ?rval, "post process failed with stop on failure");
                    if let Some(observer) = observer {
                        observer.pipeline_fatal(&pipeline);
                    }
                }
            });
        match spawned {
            Ok(handle) => lock(&self.workers).push(handle),
            Err(e) => tracing::error!(pipeline = %self.id, error = %e, "could not start post process"),
        }
    }

    /// Kill every active run once all runs have been launched.
    ///
    /// No-op before start and after completion. Idempotent.
    pub fn force_kill_all(&self) {
        if lock(&self.inner).state == PipelineState::NotStarted {
            return;
        }
        self.all_launched.wait();

        let victims: Vec<Arc<Run>> = {
            let mut inner = lock(&self.inner);
            if inner.active.is_empty() {
                return;
            }
            if !inner.force_killed {
                inner.force_killed = true;
                if let Err(e) = inner.transition(PipelineState::Killed) {
                    tracing::error!(pipeline = %self.id, error = %e, "unexpected pipeline state");
                }
                tracing::warn!(pipeline = %self.id, active = inner.active.len(), "force killing pipeline");
            }
            let victims = inner
                .launched
                .iter()
                .filter(|r| inner.active.contains(r.name()))
                .cloned()
                .collect();
            victims
        };
        for run in victims {
            run.kill();
        }
    }

    /// Current status record.
    pub fn get_state(&self) -> StatusRecord {
        let inner = lock(&self.inner);
        if inner.state == PipelineState::NotStarted {
            return StatusRecord::new(PipelineState::NotStarted);
        }
        if !inner.force_killed && !inner.active.is_empty() {
            return StatusRecord::new(PipelineState::Running);
        }

        let reports: Vec<RunReport> = inner.launched.iter().filter_map(|r| r.report()).collect();
        let return_codes = reports
            .iter()
            .map(|r| (r.name.clone(), r.exit_code))
            .collect();
        if inner.force_killed {
            return StatusRecord {
                state: PipelineState::Killed,
                reason: None,
                return_codes,
            };
        }
        StatusRecord::done(Reason::worst(reports.iter().map(RunReport::reason)), return_codes)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_complete()
    }

    /// Block until every run has finished; returns the final record.
    pub fn wait_finished(&self) -> StatusRecord {
        self.finished.wait()
    }

    /// Wait for the management thread, run threads, kill helpers and the
    /// post-process hook.
    pub fn join(&self) {
        let manager = lock(&self.manager).take();
        if let Some(handle) = manager {
            if handle.join().is_err() {
                tracing::error!(pipeline = %self.id, "management thread panicked");
            }
        }
        let workers: Vec<_> = lock(&self.workers).drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!(pipeline = %self.id, "pipeline thread panicked");
            }
        }
        for run in self.launched_runs() {
            run.join_helpers();
        }
    }
}

fn launch_request(run: &Run) -> LaunchRequest<'_> {
    let spec = run.spec();
    let (nodes, tasks_per_node) = match run.placement() {
        Some(p) => (p.nodes.len() as u32, p.tasks_per_node),
        None => (1, spec.nprocs),
    };
    LaunchRequest {
        exe: &spec.exe,
        args: &spec.args,
        nprocs: spec.nprocs,
        nodes,
        tasks_per_node,
        hostfile: spec.hostfile.as_deref(),
        sched_args: &spec.sched_args,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{DirectLauncher, MpiLauncher};
    use crate::state::RunState;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        finished: Mutex<Vec<String>>,
        fatal: Mutex<Vec<String>>,
    }

    impl PipelineObserver for Recorder {
        fn pipeline_finished(&self, pipeline: &Arc<Pipeline>) {
            lock(&self.finished).push(pipeline.id().to_string());
        }

        fn pipeline_fatal(&self, pipeline: &Arc<Pipeline>) {
            lock(&self.fatal).push(pipeline.id().to_string());
        }
    }

    fn sh(dir: &TempDir, name: &str, script: &str) -> RunSpec {
        RunSpec::new(name, "/bin/sh", dir.path()).with_args(["-c", script])
    }

    fn node_ids(n: u32) -> Vec<NodeId> {
        (1..=n).map(|i| NodeId::new(i.to_string())).collect()
    }

    fn run_to_end(pipeline: &Arc<Pipeline>, recorder: &Arc<Recorder>) -> StatusRecord {
        let cost = pipeline.resolve_layout(4).unwrap();
        pipeline
            .start(node_ids(cost), &DirectLauncher, Arc::clone(recorder) as Arc<dyn PipelineObserver>)
            .unwrap();
        let status = pipeline.wait_finished();
        pipeline.join();
        status
    }

    #[test]
    fn test_runs_ordered_by_predecessor() {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::new(
            "p",
            dir.path(),
            vec![
                sh(&dir, "c", "true").after("b"),
                sh(&dir, "b", "true").after("a"),
                sh(&dir, "a", "true"),
            ],
            PipelineOptions::default(),
            TerminationPolicy::quick(),
        )
        .unwrap();
        let names: Vec<&str> = pipeline.runs().iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_names_every_unplaced_run() {
        let dir = TempDir::new().unwrap();
        let err = Pipeline::new(
            "p",
            dir.path(),
            vec![
                sh(&dir, "free", "true"),
                sh(&dir, "x", "true").after("y"),
                sh(&dir, "y", "true").after("x"),
            ],
            PipelineOptions::default(),
            TerminationPolicy::quick(),
        )
        .unwrap_err();
        match err {
            PipelineError::CyclicDependency { runs, .. } => assert_eq!(runs, vec!["x", "y"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_definition_errors() {
        let dir = TempDir::new().unwrap();
        let policy = TerminationPolicy::quick();
        assert!(matches!(
            Pipeline::new("p", dir.path(), Vec::new(), PipelineOptions::default(), policy),
            Err(PipelineError::Empty(_))
        ));
        assert!(matches!(
            Pipeline::new(
                "p",
                dir.path(),
                vec![sh(&dir, "a", "true"), sh(&dir, "a", "true")],
                PipelineOptions::default(),
                policy
            ),
            Err(PipelineError::DuplicateRun { .. })
        ));
        assert!(matches!(
            Pipeline::new(
                "p",
                dir.path(),
                vec![sh(&dir, "a", "true").after("ghost")],
                PipelineOptions::default(),
                policy
            ),
            Err(PipelineError::UnknownPredecessor { .. })
        ));
    }

    #[test]
    fn test_node_cost_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut a = sh(&dir, "a", "true");
        a.nprocs = 6;
        let pipeline = Pipeline::new(
            "p",
            dir.path(),
            vec![a, sh(&dir, "b", "true")],
            PipelineOptions::default(),
            TerminationPolicy::quick(),
        )
        .unwrap();
        assert_eq!(pipeline.node_cost(), None);
        assert_eq!(pipeline.resolve_layout(4).unwrap(), 3);
        assert_eq!(pipeline.resolve_layout(4).unwrap(), 3);
        assert_eq!(pipeline.resolve_layout(64).unwrap(), 3);
        assert_eq!(pipeline.node_cost(), Some(3));
    }

    #[test]
    fn test_declared_total_nodes_is_lower_bound() {
        let dir = TempDir::new().unwrap();
        let options = PipelineOptions {
            total_nodes: Some(5),
            ..PipelineOptions::default()
        };
        let pipeline = Pipeline::new(
            "p",
            dir.path(),
            vec![sh(&dir, "a", "true")],
            options,
            TerminationPolicy::quick(),
        )
        .unwrap();
        assert_eq!(pipeline.resolve_layout(4).unwrap(), 5);
    }

    #[test]
    fn test_start_requires_resolved_layout_and_nodes() {
        let dir = TempDir::new().unwrap();
        let recorder: Arc<dyn PipelineObserver> = Arc::new(Recorder::default());
        let pipeline = Pipeline::new(
            "p",
            dir.path(),
            vec![sh(&dir, "a", "true"), sh(&dir, "b", "true")],
            PipelineOptions::default(),
            TerminationPolicy::quick(),
        )
        .unwrap();
        assert!(matches!(
            pipeline.start(node_ids(2), &DirectLauncher, Arc::clone(&recorder)),
            Err(PipelineError::Unresolved(_))
        ));
        pipeline.resolve_layout(4).unwrap();
        assert!(matches!(
            pipeline.start(node_ids(1), &DirectLauncher, recorder),
            Err(PipelineError::InsufficientNodes { need: 2, got: 1, .. })
        ));
        assert_eq!(pipeline.get_state().state, PipelineState::NotStarted);
    }

    #[test]
    fn test_success_aggregates_and_notifies() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let pipeline = Pipeline::new(
            "ok",
            dir.path(),
            vec![sh(&dir, "a", "exit 0"), sh(&dir, "b", "exit 0").after("a")],
            PipelineOptions::default(),
            TerminationPolicy::quick(),
        )
        .unwrap();

        let status = run_to_end(&pipeline, &recorder);
        assert_eq!(status.state, PipelineState::Done);
        assert_eq!(status.reason, Some(Reason::Succeeded));
        assert_eq!(status.return_codes.len(), 2);
        assert_eq!(status.return_codes["a"], Some(0));
        assert_eq!(*lock(&recorder.finished), vec!["ok"]);
        assert!(dir.path().join(TOTAL_WALLTIME_NAME).exists());

        let placement = pipeline.run("a").unwrap().placement().unwrap();
        assert_eq!(placement.nodes, vec![NodeId::new("1")]);
        let placement = pipeline.run("b").unwrap().placement().unwrap();
        assert_eq!(placement.nodes, vec![NodeId::new("2")]);
    }

    #[test]
    fn test_reason_priority() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut slow = sh(&dir, "slow", "sleep 10");
        slow.timeout = Some(Duration::from_millis(200));
        let pipeline = Pipeline::new(
            "mixed",
            dir.path(),
            vec![sh(&dir, "bad", "exit 2"), slow, sh(&dir, "good", "true")],
            PipelineOptions::default(),
            TerminationPolicy::quick(),
        )
        .unwrap();

        let status = run_to_end(&pipeline, &recorder);
        assert_eq!(status.reason, Some(Reason::Timeout));
        assert_eq!(status.return_codes["bad"], Some(2));
    }

    #[test]
    fn test_partial_failure_kills_the_rest_once() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let options = PipelineOptions {
            kill_on_partial_failure: true,
            ..PipelineOptions::default()
        };
        let pipeline = Pipeline::new(
            "cascade",
            dir.path(),
            vec![
                sh(&dir, "a", "sleep 10"),
                sh(&dir, "b", "sleep 0.5; exit 3"),
                sh(&dir, "c", "sleep 10"),
            ],
            options,
            TerminationPolicy::quick(),
        )
        .unwrap();

        let status = run_to_end(&pipeline, &recorder);
        assert_eq!(status.state, PipelineState::Done);
        assert_eq!(status.reason, Some(Reason::Failed));
        assert_eq!(status.return_codes.len(), 3);
        assert_eq!(status.return_codes["b"], Some(3));
        for name in ["a", "c"] {
            let run = pipeline.run(name).unwrap();
            assert_eq!(run.state(), RunState::Killed);
            assert_eq!(run.termination_attempts(), 1);
        }
    }

    #[test]
    fn test_force_kill_all() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let pipeline = Pipeline::new(
            "doomed",
            dir.path(),
            vec![sh(&dir, "a", "sleep 10"), sh(&dir, "b", "sleep 10")],
            PipelineOptions {
                post_process: Some(PostProcess {
                    script: "/bin/true".to_string(),
                    args: Vec::new(),
                    stop_on_failure: false,
                }),
                ..PipelineOptions::default()
            },
            TerminationPolicy::quick(),
        )
        .unwrap();
        pipeline.resolve_layout(4).unwrap();
        pipeline
            .start(node_ids(2), &DirectLauncher, Arc::clone(&recorder) as Arc<dyn PipelineObserver>)
            .unwrap();
        while pipeline.launched_runs().iter().any(|r| r.pgid().is_none()) {
            thread::sleep(Duration::from_millis(10));
        }

        pipeline.force_kill_all();
        pipeline.force_kill_all();
        let status = pipeline.wait_finished();
        pipeline.join();

        assert_eq!(status.state, PipelineState::Killed);
        assert!(pipeline.is_force_killed());
        assert_eq!(pipeline.get_state().state, PipelineState::Killed);
        for run in pipeline.runs() {
            assert_eq!(run.termination_attempts(), 1);
        }
        // Force-killed pipelines skip the hook.
        assert!(!post_process_ran(dir.path()));
        assert_eq!(*lock(&recorder.finished), vec!["doomed"]);
    }

    fn post_process_ran(dir: &Path) -> bool {
        crate::run::RunArtifacts::new(dir, POST_PROCESS_NAME)
            .return_code
            .exists()
    }

    #[test]
    fn test_force_kill_before_start_is_noop() {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::new(
            "idle",
            dir.path(),
            vec![sh(&dir, "a", "true")],
            PipelineOptions::default(),
            TerminationPolicy::quick(),
        )
        .unwrap();
        pipeline.force_kill_all();
        assert_eq!(pipeline.get_state().state, PipelineState::NotStarted);
        assert!(!pipeline.is_force_killed());
    }

    #[test]
    fn test_post_process_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let pipeline = Pipeline::new(
            "pp",
            dir.path(),
            vec![sh(&dir, "a", "true")],
            PipelineOptions {
                post_process: Some(PostProcess {
                    script: "/bin/sh".to_string(),
                    args: vec!["-c".to_string(), "exit 1".to_string()],
                    stop_on_failure: true,
                }),
                ..PipelineOptions::default()
            },
            TerminationPolicy::quick(),
        )
        .unwrap();

        let status = run_to_end(&pipeline, &recorder);
        assert_eq!(status.reason, Some(Reason::Succeeded));
        assert!(post_process_ran(dir.path()));
        assert_eq!(*lock(&recorder.fatal), vec!["pp"]);
    }

    #[test]
    fn test_mpmd_falls_back_without_support() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let pipeline = Pipeline::new(
            "fallback",
            dir.path(),
            vec![sh(&dir, "a", "true"), sh(&dir, "b", "true")],
            PipelineOptions {
                launch_mode: LaunchMode::Mpmd,
                ..PipelineOptions::default()
            },
            TerminationPolicy::quick(),
        )
        .unwrap();

        let status = run_to_end(&pipeline, &recorder);
        let names: Vec<String> = pipeline.launched_runs().iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(status.reason, Some(Reason::Succeeded));
    }

    #[test]
    fn test_mpmd_builds_one_joint_run() {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::new(
            "joint",
            dir.path(),
            vec![sh(&dir, "a", "true"), sh(&dir, "b", "true")],
            PipelineOptions {
                launch_mode: LaunchMode::Mpmd,
                ..PipelineOptions::default()
            },
            TerminationPolicy::quick(),
        )
        .unwrap();
        pipeline.resolve_layout(4).unwrap();

        let launcher = MpiLauncher::mpiexec().without_path_lookup();
        let joint = pipeline.mpmd_run(&launcher, &node_ids(2)).unwrap();
        assert_eq!(joint.name(), MPMD_RUN_NAME);
        assert_eq!(joint.spec().nprocs, 2);
        let argv = joint.command();
        assert_eq!(argv[0], "mpiexec");
        assert_eq!(argv.iter().filter(|a| *a == ":").count(), 1);
    }

    #[test]
    fn test_mpmd_env_later_run_wins() {
        let dir = TempDir::new().unwrap();
        let mut a = sh(&dir, "a", "true");
        a.env.insert("OMP_NUM_THREADS".into(), "2".into());
        a.env.insert("SIM_ONLY".into(), "1".into());
        let mut b = sh(&dir, "b", "true");
        b.env.insert("OMP_NUM_THREADS".into(), "8".into());
        let pipeline = Pipeline::new(
            "envs",
            dir.path(),
            vec![a, b],
            PipelineOptions {
                launch_mode: LaunchMode::Mpmd,
                ..PipelineOptions::default()
            },
            TerminationPolicy::quick(),
        )
        .unwrap();
        pipeline.resolve_layout(4).unwrap();

        let launcher = MpiLauncher::mpiexec().without_path_lookup();
        let joint = pipeline.mpmd_run(&launcher, &node_ids(2)).unwrap();
        let env = &joint.spec().env;
        assert_eq!(env.get("OMP_NUM_THREADS").map(String::as_str), Some("8"));
        assert_eq!(env.get("SIM_ONLY").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_launcher_error_becomes_exception() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let pipeline = Pipeline::new(
            "nolauncher",
            dir.path(),
            vec![sh(&dir, "a", "true")],
            PipelineOptions::default(),
            TerminationPolicy::quick(),
        )
        .unwrap();
        pipeline.resolve_layout(4).unwrap();

        #[derive(Debug)]
        struct Broken;
        impl Launcher for Broken {
            fn kind(&self) -> crate::launcher::LauncherKind {
                crate::launcher::LauncherKind::Mpiexec
            }
            fn wrap(&self, _run: &LaunchRequest<'_>) -> crate::launcher::LauncherResult<Vec<String>> {
                Err(crate::launcher::LauncherError::NotFound("mpiexec".to_string()))
            }
        }

        pipeline
            .start(node_ids(1), &Broken, Arc::clone(&recorder) as Arc<dyn PipelineObserver>)
            .unwrap();
        let status = pipeline.wait_finished();
        pipeline.join();
        assert_eq!(status.reason, Some(Reason::Exception));
        assert_eq!(status.return_codes["a"], None);
    }

    #[test]
    fn test_double_start_rejected() {
        let dir = TempDir::new().unwrap();
        let recorder: Arc<dyn PipelineObserver> = Arc::new(Recorder::default());
        let pipeline = Pipeline::new(
            "twice",
            dir.path(),
            vec![sh(&dir, "a", "true")],
            PipelineOptions::default(),
            TerminationPolicy::quick(),
        )
        .unwrap();
        pipeline.resolve_layout(4).unwrap();
        pipeline.start(node_ids(1), &DirectLauncher, Arc::clone(&recorder)).unwrap();
        assert!(matches!(
            pipeline.start(node_ids(1), &DirectLauncher, recorder),
            Err(PipelineError::AlreadyStarted(_))
        ));
        pipeline.wait_finished();
        pipeline.join();
    }
}
