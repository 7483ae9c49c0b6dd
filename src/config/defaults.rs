//! Built-in defaults (layer 1)

use serde::{Deserialize, Serialize};

use crate::launcher::LauncherKind;
use crate::timeout::{
    KILL_WAIT_SECONDS, POST_PROCESS_TIMEOUT_SECONDS, WAIT_DELAY_GIVE_UP_SECONDS,
    WAIT_DELAY_KILL_SECONDS,
};

use super::settings::LogLevel;

/// Values used when neither the config file nor the CLI sets them.
///
/// `max_nodes` and `processes_per_node` have no default: they describe the
/// allocation and must always be given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    pub runner: LauncherKind,
    pub log_level: LogLevel,
    pub kill_all_on_fatal: bool,
    pub kill_wait_seconds: u64,
    pub pgroup_kill_after_seconds: u64,
    pub pgroup_give_up_seconds: u64,
    pub post_process_timeout_seconds: u64,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            runner: LauncherKind::None,
            log_level: LogLevel::Info,
            kill_all_on_fatal: false,
            kill_wait_seconds: KILL_WAIT_SECONDS,
            pgroup_kill_after_seconds: WAIT_DELAY_KILL_SECONDS,
            pgroup_give_up_seconds: WAIT_DELAY_GIVE_UP_SECONDS,
            post_process_timeout_seconds: POST_PROCESS_TIMEOUT_SECONDS,
        }
    }
}

impl BuiltinDefaults {
    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "runner": self.runner,
            "log_level": self.log_level,
            "kill_all_on_fatal": self.kill_all_on_fatal,
            "termination": {
                "kill_wait_seconds": self.kill_wait_seconds,
                "pgroup_kill_after_seconds": self.pgroup_kill_after_seconds,
                "pgroup_give_up_seconds": self.pgroup_give_up_seconds,
                "post_process_timeout_seconds": self.post_process_timeout_seconds
            }
        })
    }
}
