//! Termination timing for runs and process groups
//!
//! All waits the engine performs while stopping processes live here:
//! - `kill_wait`: grace window between SIGTERM and SIGKILL
//! - `pgroup_kill_after`: how long a process group may outlive its leader
//!   before it is SIGKILLed
//! - `pgroup_give_up`: how long to keep polling a lingering group at all
//! - `post_process_timeout`: limit on the pipeline post-process hook

use std::time::{Duration, Instant};

/// Seconds between SIGTERM and SIGKILL.
pub const KILL_WAIT_SECONDS: u64 = 30;

/// Seconds a group may linger after its leader exits before SIGKILL.
pub const WAIT_DELAY_KILL_SECONDS: u64 = 30;

/// Seconds after which a lingering group is logged and abandoned.
pub const WAIT_DELAY_GIVE_UP_SECONDS: u64 = 120;

/// Post-process hook limit in seconds.
pub const POST_PROCESS_TIMEOUT_SECONDS: u64 = 120;

/// Poll interval while waiting on a child.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Termination timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    pub kill_wait: Duration,
    pub pgroup_kill_after: Duration,
    pub pgroup_give_up: Duration,
    /// First back-off delay when polling a lingering group; doubles each time.
    pub pgroup_initial_delay: Duration,
    pub post_process_timeout: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            kill_wait: Duration::from_secs(KILL_WAIT_SECONDS),
            pgroup_kill_after: Duration::from_secs(WAIT_DELAY_KILL_SECONDS),
            pgroup_give_up: Duration::from_secs(WAIT_DELAY_GIVE_UP_SECONDS),
            pgroup_initial_delay: Duration::from_secs(1),
            post_process_timeout: Duration::from_secs(POST_PROCESS_TIMEOUT_SECONDS),
        }
    }
}

impl TerminationPolicy {
    /// Validate ordering between the group deadlines
    pub fn validate(&self) -> Result<(), TimeoutValidationError> {
        if self.kill_wait.is_zero() {
            return Err(TimeoutValidationError::ZeroKillWait);
        }
        if self.pgroup_initial_delay.is_zero() {
            return Err(TimeoutValidationError::ZeroInitialDelay);
        }
        if self.pgroup_give_up < self.pgroup_kill_after {
            return Err(TimeoutValidationError::GiveUpBeforeKill {
                give_up: self.pgroup_give_up.as_secs_f64(),
                kill_after: self.pgroup_kill_after.as_secs_f64(),
            });
        }
        if self.post_process_timeout.is_zero() {
            return Err(TimeoutValidationError::ZeroPostProcess);
        }
        Ok(())
    }

    /// Create a policy from effective config values (seconds)
    pub fn from_config(
        kill_wait: Option<u64>,
        pgroup_kill_after: Option<u64>,
        pgroup_give_up: Option<u64>,
        post_process: Option<u64>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            kill_wait: kill_wait.map(Duration::from_secs).unwrap_or(defaults.kill_wait),
            pgroup_kill_after: pgroup_kill_after
                .map(Duration::from_secs)
                .unwrap_or(defaults.pgroup_kill_after),
            pgroup_give_up: pgroup_give_up
                .map(Duration::from_secs)
                .unwrap_or(defaults.pgroup_give_up),
            pgroup_initial_delay: defaults.pgroup_initial_delay,
            post_process_timeout: post_process
                .map(Duration::from_secs)
                .unwrap_or(defaults.post_process_timeout),
        }
    }

    /// Short timings for tests that spawn real processes.
    pub fn quick() -> Self {
        Self {
            kill_wait: Duration::from_millis(500),
            pgroup_kill_after: Duration::from_millis(200),
            pgroup_give_up: Duration::from_millis(800),
            pgroup_initial_delay: Duration::from_millis(20),
            post_process_timeout: Duration::from_secs(5),
        }
    }
}

/// Termination policy validation errors
#[derive(Debug, thiserror::Error)]
pub enum TimeoutValidationError {
    #[error("kill_wait_seconds must be positive")]
    ZeroKillWait,

    #[error("process group back-off must start above zero")]
    ZeroInitialDelay,

    #[error("pgroup_give_up_seconds ({give_up}) must not be less than pgroup_kill_after_seconds ({kill_after})")]
    GiveUpBeforeKill { give_up: f64, kill_after: f64 },

    #[error("post_process_timeout_seconds must be positive")]
    ZeroPostProcess,
}

/// Wall-clock deadline for a single run.
///
/// The deadline only reports; the run thread decides what to do once it
/// has passed.
#[derive(Debug)]
pub struct RunDeadline {
    start: Instant,
    limit: Option<Duration>,
}

impl RunDeadline {
    pub fn new(limit: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            limit,
        }
    }

    pub fn expired(&self) -> bool {
        self.limit.is_some_and(|limit| self.start.elapsed() >= limit)
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Time left, `None` when there is no limit.
    pub fn remaining(&self) -> Option<Duration> {
        self.limit
            .map(|limit| limit.saturating_sub(self.start.elapsed()))
    }
}
