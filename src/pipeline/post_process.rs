//! Optional hook run after every run of a pipeline has finished.

use std::fs::File;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Instant;

use crate::process::{exit_code, spawn_in_new_group, terminate_child};
use crate::run::RunArtifacts;
use crate::timeout::{RunDeadline, TerminationPolicy, POLL_INTERVAL};

/// Artifact name suffix for the hook's output files.
pub const POST_PROCESS_NAME: &str = "post-process";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostProcess {
    pub script: String,
    pub args: Vec<String>,
    /// Escalate a failed hook to the pipeline-fatal notification.
    pub stop_on_failure: bool,
}

impl PostProcess {
    /// Run the hook in `working_dir` and record its artifacts.
    ///
    /// Returns the exit code, or `None` if the hook could not be started or
    /// was stopped at the timeout. Never fails: problems are logged.
    pub fn execute(&self, pipeline: &str, working_dir: &Path, policy: &TerminationPolicy) -> Option<i32> {
        let artifacts = RunArtifacts::new(working_dir, POST_PROCESS_NAME);
        let start = Instant::now();
        let rval = match self.spawn_and_wait(&artifacts, working_dir, policy) {
            Ok(rval) => rval,
            Err(e) => {
                tracing::warn!(pipeline = %pipeline, error = %e, "failed to run post process script");
                None
            }
        };
        let elapsed = start.elapsed();

        if let Err(e) = artifacts.write_return_code(rval) {
            tracing::warn!(pipeline = %pipeline, error = %e, "could not save post process return code");
        }
        if let Err(e) = artifacts.write_walltime(elapsed) {
            tracing::warn!(pipeline = %pipeline, error = %e, "could not save post process walltime");
        }
        tracing::info!(pipeline = %pipeline, rval = ?rval, "post process finished");
        rval
    }

    fn spawn_and_wait(
        &self,
        artifacts: &RunArtifacts,
        working_dir: &Path,
        policy: &TerminationPolicy,
    ) -> io::Result<Option<i32>> {
        let mut command = Command::new(&self.script);
        command
            .args(&self.args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(File::create(&artifacts.stdout)?)
            .stderr(File::create(&artifacts.stderr)?);

        let (mut child, group) = spawn_in_new_group(&mut command)?;
        let deadline = RunDeadline::new(Some(policy.post_process_timeout));
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(exit_code(status)));
            }
            if deadline.expired() {
                tracing::warn!(script = %self.script, "post process script timed out");
                terminate_child(&mut child, &group, policy.kill_wait)?;
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}
