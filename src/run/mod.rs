//! One OS process inside a pipeline.
//!
//! A [`Run`] owns the whole life of its process: waiting for a predecessor,
//! spawning into a fresh process group, enforcing its timeout, reaping
//! stragglers left in the group, and persisting exit code and walltime.
//! Completion is published exactly once, through [`Run::completion`] and as
//! a [`RunReport`] on the pipeline's event channel, no matter how the run
//! ends (including a panic on the run thread).

pub mod artifacts;
pub mod environment;

use std::collections::BTreeMap;
use std::env;
use std::fs::{self, File};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use nix::sys::signal::Signal;
use savanna_layout::NodeConfig;
use serde::Serialize;
use thiserror::Error;

use crate::completion::{lock, Completion};
use crate::consumer::NodeId;
use crate::process::{exit_code, spawn_in_new_group, terminate_child, GroupWait, ProcessGroup};
use crate::state::{Reason, RunState, RunStateData, RunStateError, TerminalState};
use crate::timeout::{RunDeadline, TerminationPolicy, POLL_INTERVAL};

pub use artifacts::RunArtifacts;
pub use environment::merge_environment;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    State(#[from] RunStateError),

    #[error("run '{0}' has an empty command line")]
    EmptyCommand(String),

    #[error("run '{0}' was started twice")]
    AlreadyStarted(String),

    #[error("run '{run}' could not be wrapped by the launcher: {message}")]
    Launch { run: String, message: String },
}

pub type RunResult<T> = Result<T, RunError>;

/// Static description of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSpec {
    pub name: String,
    pub exe: String,
    pub args: Vec<String>,
    /// Overrides applied on top of the parent environment.
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub nprocs: u32,
    pub timeout: Option<Duration>,
    /// Name of the run that must finish first.
    pub after: Option<String>,
    /// Pause after launching this run before launching the next one.
    pub sleep_after: Option<Duration>,
    pub hostfile: Option<PathBuf>,
    /// Extra launcher flags, in order.
    pub sched_args: Vec<(String, String)>,
    /// Start the executable directly instead of through the launcher.
    pub runner_override: bool,
    /// Prepended to `PATH`.
    pub apps_dir: Option<PathBuf>,
}

impl RunSpec {
    pub fn new(name: impl Into<String>, exe: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            exe: exe.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: working_dir.into(),
            nprocs: 1,
            timeout: None,
            after: None,
            sleep_after: None,
            hostfile: None,
            sched_args: Vec::new(),
            runner_override: false,
            apps_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn after(mut self, predecessor: impl Into<String>) -> Self {
        self.after = Some(predecessor.into());
        self
    }
}

/// Nodes and binding a run was given when its pipeline started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub nodes: Vec<NodeId>,
    pub tasks_per_node: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_config: Option<NodeConfig>,
}

/// End state of a run. Only available once the run has completed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub name: String,
    pub state: RunState,
    /// `None` when the process never ran or its status was lost.
    pub exit_code: Option<i32>,
    pub walltime: Option<Duration>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Succeeded
    }

    /// Contribution of this run to its pipeline's reason.
    pub fn reason(&self) -> Reason {
        match self.state {
            RunState::Succeeded => Reason::Succeeded,
            RunState::TimedOut => Reason::Timeout,
            RunState::Exception => Reason::Exception,
            _ => Reason::Failed,
        }
    }
}

#[derive(Debug)]
struct Shared {
    state: RunStateData,
    kill_requested: bool,
    timeout_pending: bool,
    group: Option<ProcessGroup>,
    started: bool,
}

/// What the run thread learned before bookkeeping.
struct Finish {
    state: RunState,
    exit_code: Option<i32>,
    walltime: Option<Duration>,
}

impl Finish {
    fn killed_before_spawn() -> Self {
        Self {
            state: RunState::Killed,
            exit_code: None,
            walltime: None,
        }
    }
}

pub struct Run {
    spec: RunSpec,
    predecessor: Option<Weak<Run>>,
    policy: TerminationPolicy,
    command: OnceLock<Vec<String>>,
    launch_error: OnceLock<String>,
    placement: OnceLock<Placement>,
    shared: Mutex<Shared>,
    done: Completion<RunReport>,
    helpers: Mutex<Vec<JoinHandle<()>>>,
    termination_attempts: AtomicUsize,
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("name", &self.spec.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Run {
    /// `predecessor` must belong to the same pipeline.
    pub fn new(spec: RunSpec, predecessor: Option<&Arc<Run>>, policy: TerminationPolicy) -> Arc<Self> {
        Arc::new(Self {
            spec,
            predecessor: predecessor.map(Arc::downgrade),
            policy,
            command: OnceLock::new(),
            launch_error: OnceLock::new(),
            placement: OnceLock::new(),
            shared: Mutex::new(Shared {
                state: RunStateData::new(),
                kill_requested: false,
                timeout_pending: false,
                group: None,
                started: false,
            }),
            done: Completion::new(),
            helpers: Mutex::new(Vec::new()),
            termination_attempts: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &RunSpec {
        &self.spec
    }

    pub fn artifacts(&self) -> RunArtifacts {
        RunArtifacts::new(&self.spec.working_dir, &self.spec.name)
    }

    pub fn set_placement(&self, placement: Placement) {
        if self.placement.set(placement).is_err() {
            tracing::warn!(run = %self.spec.name, "placement already set, keeping the first");
        }
    }

    pub fn placement(&self) -> Option<&Placement> {
        self.placement.get()
    }

    /// Set the full argv, usually produced by a launcher.
    pub fn set_command(&self, argv: Vec<String>) {
        if self.command.set(argv).is_err() {
            tracing::warn!(run = %self.spec.name, "command already set, keeping the first");
        }
    }

    /// Record that no argv could be built; the run will end as an exception.
    pub fn set_launch_error(&self, message: impl Into<String>) {
        if let Err(message) = self.launch_error.set(message.into()) {
            tracing::warn!(run = %self.spec.name, error = %message, "launch error already set, keeping the first");
        }
    }

    /// Argv that will be executed.
    pub fn command(&self) -> Vec<String> {
        match self.command.get() {
            Some(argv) => argv.clone(),
            None => {
                let mut argv = vec![self.spec.exe.clone()];
                argv.extend(self.spec.args.iter().cloned());
                argv
            }
        }
    }

    pub fn state(&self) -> RunState {
        lock(&self.shared).state.state
    }

    pub fn pgid(&self) -> Option<i32> {
        lock(&self.shared).group.map(|g| g.pgid())
    }

    pub fn completion(&self) -> &Completion<RunReport> {
        &self.done
    }

    /// End state, `None` until the run completes.
    pub fn report(&self) -> Option<RunReport> {
        self.done.get()
    }

    pub fn wait(&self) -> RunReport {
        self.done.wait()
    }

    /// Number of termination sequences `kill()` has started.
    pub fn termination_attempts(&self) -> usize {
        self.termination_attempts.load(Ordering::SeqCst)
    }

    /// Launch the run thread. Completion is reported on `events`.
    pub fn start(self: &Arc<Self>, events: Sender<RunReport>) -> RunResult<JoinHandle<()>> {
        {
            let mut shared = lock(&self.shared);
            if shared.started {
                return Err(RunError::AlreadyStarted(self.spec.name.clone()));
            }
            shared.started = true;
        }
        let run = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("run-{}", self.spec.name))
            .spawn(move || run.thread_main(events))?;
        Ok(handle)
    }

    /// Request termination. Safe from any thread.
    ///
    /// Returns false (and does nothing) if the run already finished, was
    /// already killed, or is handling its own timeout. Killing a run that has
    /// not spawned yet prevents the spawn.
    pub fn kill(&self) -> bool {
        let mut shared = lock(&self.shared);
        if shared.state.state.is_terminal() || shared.kill_requested || shared.timeout_pending {
            return false;
        }
        shared.kill_requested = true;

        let Some(group) = shared.group else {
            tracing::info!(run = %self.spec.name, "killed before spawn");
            return true;
        };
        drop(shared);

        self.termination_attempts.fetch_add(1, Ordering::SeqCst);
        let grace = self.policy.kill_wait;
        let name = self.spec.name.clone();
        tracing::info!(run = %name, pgid = group.pgid(), "killing process group");
        let spawned = thread::Builder::new()
            .name(format!("kill-{}", self.spec.name))
            .spawn(move || {
                if let Err(e) = group.terminate(grace) {
                    tracing::warn!(run = %name, error = %e, "kill sequence failed");
                }
            });
        match spawned {
            Ok(handle) => lock(&self.helpers).push(handle),
            Err(e) => {
                tracing::error!(run = %self.spec.name, error = %e, "could not start kill helper, killing inline");
                if let Err(e) = group.signal(Signal::SIGKILL) {
                    tracing::warn!(run = %self.spec.name, error = %e, "could not kill process group");
                }
            }
        }
        true
    }

    /// Publish an exception outcome for a run whose thread never started.
    pub fn fail_unstarted(&self) -> RunReport {
        let report = self.finish(Finish {
            state: RunState::Exception,
            exit_code: None,
            walltime: None,
        });
        self.done.complete(report.clone());
        report
    }

    /// Wait for kill helper threads.
    pub fn join_helpers(&self) {
        let handles: Vec<_> = lock(&self.helpers).drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!(run = %self.spec.name, "kill helper panicked");
            }
        }
    }

    fn kill_requested(&self) -> bool {
        lock(&self.shared).kill_requested
    }

    fn thread_main(self: Arc<Self>, events: Sender<RunReport>) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute()));
        let finish = match outcome {
            Ok(Ok(finish)) => finish,
            Ok(Err(e)) => {
                tracing::error!(run = %self.spec.name, error = %e, "run raised an error");
                self.abandon_group();
                Finish {
                    state: RunState::Exception,
                    exit_code: None,
                    walltime: None,
                }
            }
            Err(_) => {
                tracing::error!(run = %self.spec.name, "run thread panicked");
                self.abandon_group();
                Finish {
                    state: RunState::Exception,
                    exit_code: None,
                    walltime: None,
                }
            }
        };

        let report = self.finish(finish);
        self.done.complete(report.clone());
        if events.send(report).is_err() {
            tracing::debug!(run = %self.spec.name, "pipeline no longer listening");
        }
    }

    /// SIGKILL whatever is left after an error mid-run.
    fn abandon_group(&self) {
        let group = {
            let shared = lock(&self.shared);
            if shared.state.state == RunState::Running {
                shared.group
            } else {
                None
            }
        };
        if let Some(group) = group {
            if let Err(e) = group.signal(Signal::SIGKILL) {
                tracing::warn!(run = %self.spec.name, error = %e, "could not kill abandoned process group");
            }
        }
    }

    fn finish(&self, finish: Finish) -> RunReport {
        let mut shared = lock(&self.shared);
        if let Err(e) = shared.state.transition(finish.state) {
            // Only reachable through a bug in the run thread; the outcome
            // still has to be published.
            tracing::error!(run = %self.spec.name, error = %e, "forcing final state");
            shared.state.state = finish.state;
        }
        tracing::info!(
            run = %self.spec.name,
            state = ?finish.state,
            exit_code = ?finish.exit_code,
            "run finished"
        );
        RunReport {
            name: self.spec.name.clone(),
            state: finish.state,
            exit_code: finish.exit_code,
            walltime: finish.walltime,
        }
    }

    fn wait_for_predecessor(&self) {
        let Some(pred) = self.predecessor.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        tracing::debug!(run = %self.spec.name, after = %pred.name(), "waiting for predecessor");
        while pred.done.wait_timeout(POLL_INTERVAL).is_none() {
            if self.kill_requested() {
                return;
            }
        }
    }

    fn execute(&self) -> RunResult<Finish> {
        self.wait_for_predecessor();
        if self.kill_requested() {
            return Ok(Finish::killed_before_spawn());
        }

        if let Some(message) = self.launch_error.get() {
            return Err(RunError::Launch {
                run: self.spec.name.clone(),
                message: message.clone(),
            });
        }
        let argv = self.command();
        let Some((program, args)) = argv.split_first() else {
            return Err(RunError::EmptyCommand(self.spec.name.clone()));
        };

        let artifacts = self.artifacts();
        fs::create_dir_all(&self.spec.working_dir)?;
        let env = merge_environment(env::vars(), &self.spec.env, self.spec.apps_dir.as_deref());
        if let Err(e) = artifacts.write_environment(&env) {
            tracing::warn!(run = %self.spec.name, error = %e, "could not save environment");
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&self.spec.working_dir)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(File::create(&artifacts.stdout)?)
            .stderr(File::create(&artifacts.stderr)?);

        let start = Instant::now();
        let (mut child, group) = {
            let mut shared = lock(&self.shared);
            if shared.kill_requested {
                return Ok(Finish::killed_before_spawn());
            }
            shared.state.transition(RunState::Starting)?;
            let (child, group) = spawn_in_new_group(&mut command)?;
            shared.group = Some(group);
            shared.state.transition(RunState::Running)?;
            (child, group)
        };
        tracing::info!(
            run = %self.spec.name,
            pid = child.id(),
            pgid = group.pgid(),
            argv = ?argv,
            "run started"
        );

        let deadline = RunDeadline::new(self.spec.timeout);
        let (status, timed_out) = loop {
            if let Some(status) = child.try_wait()? {
                break (status, false);
            }
            if deadline.expired() && self.claim_timeout() {
                tracing::warn!(run = %self.spec.name, "timeout reached, terminating");
                let (status, _) = terminate_child(&mut child, &group, self.policy.kill_wait)?;
                // A clean exit during the grace window is not a timeout.
                break (status, !status.success());
            }
            thread::sleep(POLL_INTERVAL);
        };
        let walltime = start.elapsed();
        let code = exit_code(status);

        match group.wait_gone(&self.policy) {
            GroupWait::Gone => {}
            GroupWait::Killed => {
                tracing::warn!(run = %self.spec.name, "stray processes in group were killed")
            }
            GroupWait::Abandoned => {
                tracing::error!(run = %self.spec.name, "stray processes in group survived SIGKILL")
            }
        }

        let state = if timed_out {
            RunState::TimedOut
        } else if self.kill_requested() {
            RunState::Killed
        } else if code == 0 {
            RunState::Succeeded
        } else {
            RunState::Failed
        };

        let persisted = artifacts
            .write_return_code(Some(code))
            .and_then(|()| artifacts.write_walltime(walltime));
        let state = match persisted {
            Ok(()) => state,
            Err(e) => {
                tracing::error!(run = %self.spec.name, error = %e, "could not save exit code");
                RunState::Exception
            }
        };

        Ok(Finish {
            state,
            exit_code: Some(code),
            walltime: Some(walltime),
        })
    }

    /// Take ownership of termination for a timeout; fails if a kill beat us.
    fn claim_timeout(&self) -> bool {
        let mut shared = lock(&self.shared);
        if shared.kill_requested {
            return false;
        }
        shared.timeout_pending = true;
        true
    }
}
