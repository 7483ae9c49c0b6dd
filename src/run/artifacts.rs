//! Per-run artifact files in the run's working directory.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const STDOUT_NAME: &str = "codar.workflow.stdout";
pub const STDERR_NAME: &str = "codar.workflow.stderr";
pub const RETURN_NAME: &str = "codar.workflow.return";
pub const WALLTIME_NAME: &str = "codar.workflow.walltime";

/// Whole-pipeline walltime file, written when the last run finishes.
pub const TOTAL_WALLTIME_NAME: &str = "codar.savanna.total.walltime";

/// Paths of the files a run (or the post-process hook) leaves behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArtifacts {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub return_code: PathBuf,
    pub walltime: PathBuf,
    pub environment: PathBuf,
}

impl RunArtifacts {
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            stdout: dir.join(format!("{STDOUT_NAME}.{name}")),
            stderr: dir.join(format!("{STDERR_NAME}.{name}")),
            return_code: dir.join(format!("{RETURN_NAME}.{name}")),
            walltime: dir.join(format!("{WALLTIME_NAME}.{name}")),
            environment: dir.join(format!(".codar.savanna.{name}.environment.json")),
        }
    }

    /// Write the exit code; `None` is written for a process that never
    /// reported one.
    pub fn write_return_code(&self, code: Option<i32>) -> io::Result<()> {
        let text = match code {
            Some(code) => format!("{code}\n"),
            None => "None\n".to_string(),
        };
        fs::write(&self.return_code, text)
    }

    pub fn write_walltime(&self, walltime: Duration) -> io::Result<()> {
        write_seconds(&self.walltime, walltime)
    }

    pub fn write_environment(&self, env: &BTreeMap<String, String>) -> io::Result<()> {
        let json = serde_json::to_string_pretty(env)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&self.environment, json)
    }
}

/// Write a duration as fractional seconds followed by a newline.
pub fn write_seconds(path: &Path, duration: Duration) -> io::Result<()> {
    fs::write(path, format!("{}\n", duration.as_secs_f64()))
}

/// Read back a return-code file.
pub fn read_return_code(path: &Path) -> io::Result<Option<i32>> {
    let text = fs::read_to_string(path)?;
    let text = text.trim();
    if text == "None" {
        return Ok(None);
    }
    text.parse()
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
