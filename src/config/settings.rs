//! Typed view of the merged configuration.

use serde::{Deserialize, Serialize};

use crate::launcher::LauncherKind;
use crate::timeout::{TerminationPolicy, TimeoutValidationError};

/// Log verbosity as accepted on the command line.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    #[value(name = "DEBUG")]
    Debug,
    #[default]
    #[value(name = "INFO")]
    Info,
    #[value(name = "WARNING")]
    Warning,
    #[value(name = "ERROR")]
    Error,
    #[value(name = "CRITICAL")]
    Critical,
}

impl LogLevel {
    /// `EnvFilter` directive for this level.
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            // tracing has no level above error
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

/// `[termination]` table, in whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationSettings {
    pub kill_wait_seconds: u64,
    pub pgroup_kill_after_seconds: u64,
    pub pgroup_give_up_seconds: u64,
    pub post_process_timeout_seconds: u64,
}

impl TerminationSettings {
    pub fn policy(&self) -> Result<TerminationPolicy, TimeoutValidationError> {
        let policy = TerminationPolicy::from_config(
            Some(self.kill_wait_seconds),
            Some(self.pgroup_kill_after_seconds),
            Some(self.pgroup_give_up_seconds),
            Some(self.post_process_timeout_seconds),
        );
        policy.validate()?;
        Ok(policy)
    }
}

/// Everything the engine needs after layering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub max_nodes: u32,
    pub processes_per_node: u32,
    pub runner: LauncherKind,
    pub log_level: LogLevel,
    pub kill_all_on_fatal: bool,
    pub termination: TerminationSettings,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_log_level_names() {
        let level: LogLevel = serde_json::from_value(serde_json::json!("WARNING")).unwrap();
        assert_eq!(level, LogLevel::Warning);
        assert_eq!(level.directive(), "warn");
        assert_eq!(LogLevel::Critical.directive(), "error");
    }

    #[test]
    fn test_termination_policy() {
        let settings = TerminationSettings {
            kill_wait_seconds: 5,
            pgroup_kill_after_seconds: 10,
            pgroup_give_up_seconds: 20,
            post_process_timeout_seconds: 60,
        };
        let policy = settings.policy().unwrap();
        assert_eq!(policy.kill_wait, Duration::from_secs(5));
        assert_eq!(policy.pgroup_give_up, Duration::from_secs(20));

        let bad = TerminationSettings {
            pgroup_give_up_seconds: 1,
            ..settings
        };
        assert!(matches!(
            bad.policy(),
            Err(TimeoutValidationError::GiveUpBeforeKill { .. })
        ));
    }
}
