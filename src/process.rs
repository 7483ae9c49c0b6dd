//! Process-group spawning and graduated termination.
//!
//! Every run is spawned as the leader of a new process group so that the
//! whole tree it forks can be signalled at once.

use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use crate::timeout::{TerminationPolicy, POLL_INTERVAL};

/// Spawn `command` as the leader of a fresh process group.
pub fn spawn_in_new_group(command: &mut Command) -> io::Result<(Child, ProcessGroup)> {
    command.process_group(0);
    let child = command.spawn()?;
    let group = ProcessGroup::new(child.id() as i32);
    Ok((child, group))
}

/// Exit code with signal deaths reported as `-signum`.
pub fn exit_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => status.signal().map(|s| -s).unwrap_or(-1),
    }
}

/// Handle to a process group; holds no reference to the child itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroup {
    pgid: i32,
}

/// How a lingering group wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupWait {
    /// No member remained.
    Gone,
    /// Members remained past the kill deadline and were SIGKILLed, then left.
    Killed,
    /// Members still remained at the give-up deadline.
    Abandoned,
}

impl ProcessGroup {
    pub fn new(pgid: i32) -> Self {
        Self { pgid }
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    /// Send `signal`. Returns false when the group no longer exists.
    pub fn signal(&self, signal: Signal) -> io::Result<bool> {
        match killpg(Pid::from_raw(self.pgid), signal) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    /// Probe with the null signal.
    pub fn exists(&self) -> bool {
        match killpg(Pid::from_raw(self.pgid), None) {
            Ok(()) => true,
            // EPERM means a member exists that we may not signal.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    /// Continue, then terminate, and kill if the group is still present
    /// after `grace`.
    ///
    /// Used from kill helper threads, which never own the child: the owning
    /// run thread reaps the leader while this polls the group.
    pub fn terminate(&self, grace: Duration) -> io::Result<()> {
        if !self.signal(Signal::SIGCONT)? {
            return Ok(());
        }
        if !self.signal(Signal::SIGTERM)? {
            return Ok(());
        }
        let start = Instant::now();
        while start.elapsed() < grace {
            if !self.exists() {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }
        tracing::warn!(pgid = self.pgid, "process group survived SIGTERM, sending SIGKILL");
        self.signal(Signal::SIGKILL)?;
        Ok(())
    }

    /// Wait for stragglers after the leader has been reaped.
    ///
    /// Polls with exponential back-off; SIGKILLs past the kill deadline and
    /// stops polling at the give-up deadline.
    pub fn wait_gone(&self, policy: &TerminationPolicy) -> GroupWait {
        let start = Instant::now();
        let mut delay = policy.pgroup_initial_delay;
        let mut killed = false;
        loop {
            if !self.exists() {
                return if killed { GroupWait::Killed } else { GroupWait::Gone };
            }
            let elapsed = start.elapsed();
            if elapsed >= policy.pgroup_give_up {
                tracing::error!(
                    pgid = self.pgid,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "process group still present, giving up"
                );
                return GroupWait::Abandoned;
            }
            if elapsed >= policy.pgroup_kill_after && !killed {
                tracing::warn!(pgid = self.pgid, "process group outlived its leader, sending SIGKILL");
                if let Err(e) = self.signal(Signal::SIGKILL) {
                    tracing::warn!(pgid = self.pgid, error = %e, "SIGKILL failed");
                }
                killed = true;
            }
            let remaining = policy.pgroup_give_up.saturating_sub(elapsed);
            thread::sleep(delay.min(remaining).max(Duration::from_millis(1)));
            delay = delay.saturating_mul(2);
        }
    }
}

/// Graduated termination of a child owned by the caller.
///
/// Returns the exit status once the child has been reaped, and whether it
/// exited on its own (any status) during the grace window.
pub fn terminate_child(
    child: &mut Child,
    group: &ProcessGroup,
    grace: Duration,
) -> io::Result<(ExitStatus, bool)> {
    group.signal(Signal::SIGCONT)?;
    group.signal(Signal::SIGTERM)?;

    let start = Instant::now();
    while start.elapsed() < grace {
        if let Some(status) = child.try_wait()? {
            return Ok((status, true));
        }
        thread::sleep(POLL_INTERVAL);
    }

    tracing::warn!(pgid = group.pgid(), "child ignored SIGTERM, sending SIGKILL");
    group.signal(Signal::SIGKILL)?;
    let status = child.wait()?;
    Ok((status, false))
}
