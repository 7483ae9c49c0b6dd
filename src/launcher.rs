//! Process launchers: turn a placed run into the argv that starts it.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("could not find \"{0}\" in PATH")]
    NotFound(String),

    #[error("unknown launcher \"{0}\"")]
    Unknown(String),
}

pub type LauncherResult<T> = Result<T, LauncherError>;

/// Everything a launcher may need to know about one run.
#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    pub exe: &'a str,
    pub args: &'a [String],
    pub nprocs: u32,
    pub nodes: u32,
    pub tasks_per_node: u32,
    pub hostfile: Option<&'a Path>,
    pub sched_args: &'a [(String, String)],
}

/// Strategy for starting a (possibly parallel) program.
pub trait Launcher: Send + Sync + fmt::Debug {
    fn kind(&self) -> LauncherKind;

    /// Full argv for one run.
    fn wrap(&self, run: &LaunchRequest<'_>) -> LauncherResult<Vec<String>>;

    /// One argv starting several programs as a single job, when supported.
    fn wrap_mpmd(&self, _runs: &[LaunchRequest<'_>]) -> Option<LauncherResult<Vec<String>>> {
        None
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LauncherKind {
    Mpiexec,
    Aprun,
    Srun,
    Jsrun,
    /// Run the executable directly.
    #[default]
    None,
}

impl LauncherKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LauncherKind::Mpiexec => "mpiexec",
            LauncherKind::Aprun => "aprun",
            LauncherKind::Srun => "srun",
            LauncherKind::Jsrun => "jsrun",
            LauncherKind::None => "none",
        }
    }

    pub fn parse(name: &str) -> LauncherResult<Self> {
        match name {
            "mpiexec" => Ok(LauncherKind::Mpiexec),
            "aprun" => Ok(LauncherKind::Aprun),
            "srun" => Ok(LauncherKind::Srun),
            "jsrun" => Ok(LauncherKind::Jsrun),
            "none" => Ok(LauncherKind::None),
            other => Err(LauncherError::Unknown(other.to_string())),
        }
    }

    /// Build the launcher. MPI launchers are looked up in `PATH` when used.
    pub fn build(self) -> Arc<dyn Launcher> {
        match self {
            LauncherKind::Mpiexec => Arc::new(MpiLauncher::mpiexec()),
            LauncherKind::Aprun => Arc::new(MpiLauncher::aprun()),
            LauncherKind::Srun => Arc::new(MpiLauncher::srun()),
            LauncherKind::Jsrun => Arc::new(JsrunLauncher::new()),
            LauncherKind::None => Arc::new(DirectLauncher),
        }
    }
}

impl fmt::Display for LauncherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve `program` against `PATH` the way a shell would.
pub fn find_in_path(program: &str) -> LauncherResult<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return if path.is_file() {
            Ok(path)
        } else {
            Err(LauncherError::NotFound(program.to_string()))
        };
    }
    env::var_os("PATH")
        .and_then(|paths| {
            env::split_paths(&paths)
                .map(|dir| dir.join(program))
                .find(|candidate| candidate.is_file())
        })
        .ok_or_else(|| LauncherError::NotFound(program.to_string()))
}

fn program_args(run: &LaunchRequest<'_>) -> Vec<String> {
    let mut argv = Vec::with_capacity(run.args.len() + 1);
    argv.push(run.exe.to_string());
    argv.extend(run.args.iter().cloned());
    argv
}

/// `exe args...`
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectLauncher;

impl Launcher for DirectLauncher {
    fn kind(&self) -> LauncherKind {
        LauncherKind::None
    }

    fn wrap(&self, run: &LaunchRequest<'_>) -> LauncherResult<Vec<String>> {
        Ok(program_args(run))
    }
}

/// mpiexec, aprun and srun share one shape and differ in flag names.
#[derive(Debug, Clone)]
pub struct MpiLauncher {
    kind: LauncherKind,
    program: &'static str,
    nprocs_flag: &'static str,
    nodes_flag: Option<&'static str>,
    tasks_per_node_flag: Option<&'static str>,
    hostfile_flag: &'static str,
    /// Skip the PATH lookup.
    verbatim: bool,
}

impl MpiLauncher {
    pub fn mpiexec() -> Self {
        Self {
            kind: LauncherKind::Mpiexec,
            program: "mpiexec",
            nprocs_flag: "-n",
            nodes_flag: None,
            tasks_per_node_flag: None,
            hostfile_flag: "--hostfile",
            verbatim: false,
        }
    }

    pub fn aprun() -> Self {
        Self {
            kind: LauncherKind::Aprun,
            program: "aprun",
            nprocs_flag: "-n",
            nodes_flag: None,
            tasks_per_node_flag: Some("-N"),
            hostfile_flag: "-L",
            verbatim: false,
        }
    }

    pub fn srun() -> Self {
        Self {
            kind: LauncherKind::Srun,
            program: "srun",
            nprocs_flag: "-n",
            nodes_flag: Some("-N"),
            tasks_per_node_flag: None,
            hostfile_flag: "-w",
            verbatim: false,
        }
    }

    /// Use the bare program name instead of its PATH location.
    pub fn without_path_lookup(mut self) -> Self {
        self.verbatim = true;
        self
    }

    fn program_path(&self) -> LauncherResult<String> {
        if self.verbatim {
            return Ok(self.program.to_string());
        }
        Ok(find_in_path(self.program)?.to_string_lossy().into_owned())
    }

    fn segment(&self, run: &LaunchRequest<'_>) -> Vec<String> {
        let mut argv = vec![self.nprocs_flag.to_string(), run.nprocs.to_string()];
        for (k, v) in run.sched_args {
            argv.push(k.clone());
            argv.push(v.clone());
        }
        if let Some(flag) = self.nodes_flag {
            argv.push(flag.to_string());
            argv.push(run.nodes.to_string());
        }
        if let Some(flag) = self.tasks_per_node_flag {
            argv.push(flag.to_string());
            argv.push(run.tasks_per_node.to_string());
        }
        if let Some(hostfile) = run.hostfile {
            argv.push(self.hostfile_flag.to_string());
            argv.push(hostfile.to_string_lossy().into_owned());
        }
        argv.extend(program_args(run));
        argv
    }
}

impl Launcher for MpiLauncher {
    fn kind(&self) -> LauncherKind {
        self.kind
    }

    fn wrap(&self, run: &LaunchRequest<'_>) -> LauncherResult<Vec<String>> {
        let mut argv = vec![self.program_path()?];
        argv.extend(self.segment(run));
        Ok(argv)
    }

    /// Only mpiexec joins programs with `:`.
    fn wrap_mpmd(&self, runs: &[LaunchRequest<'_>]) -> Option<LauncherResult<Vec<String>>> {
        if self.kind != LauncherKind::Mpiexec || runs.is_empty() {
            return None;
        }
        let program = match self.program_path() {
            Ok(p) => p,
            Err(e) => return Some(Err(e)),
        };
        let mut argv = vec![program];
        for (i, run) in runs.iter().enumerate() {
            if i > 0 {
                argv.push(":".to_string());
            }
            argv.extend(self.segment(run));
        }
        Some(Ok(argv))
    }
}

/// Summit's jsrun: one resource set per node slice, six GPUs each.
#[derive(Debug, Clone, Default)]
pub struct JsrunLauncher {
    verbatim: bool,
}

impl JsrunLauncher {
    pub const GPUS_PER_RESOURCE_SET: u32 = 6;

    pub fn new() -> Self {
        Self { verbatim: false }
    }

    pub fn without_path_lookup(mut self) -> Self {
        self.verbatim = true;
        self
    }
}

impl Launcher for JsrunLauncher {
    fn kind(&self) -> LauncherKind {
        LauncherKind::Jsrun
    }

    fn wrap(&self, run: &LaunchRequest<'_>) -> LauncherResult<Vec<String>> {
        let program = if self.verbatim {
            "jsrun".to_string()
        } else {
            find_in_path("jsrun")?.to_string_lossy().into_owned()
        };
        let tpn = run.tasks_per_node.max(1);
        let resource_sets = run.nprocs.div_ceil(tpn);
        let mut argv = vec![
            program,
            "-n".to_string(),
            resource_sets.to_string(),
            "-a".to_string(),
            tpn.to_string(),
            "-c".to_string(),
            tpn.to_string(),
            "-g".to_string(),
            Self::GPUS_PER_RESOURCE_SET.to_string(),
            "-r".to_string(),
            "1".to_string(),
        ];
        argv.extend(program_args(run));
        Ok(argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(args: &'a [String], sched: &'a [(String, String)]) -> LaunchRequest<'a> {
        LaunchRequest {
            exe: "/apps/sim",
            args,
            nprocs: 8,
            nodes: 2,
            tasks_per_node: 4,
            hostfile: None,
            sched_args: sched,
        }
    }

    #[test]
    fn test_direct() {
        let args = vec!["-v".to_string()];
        let argv = DirectLauncher.wrap(&request(&args, &[])).unwrap();
        assert_eq!(argv, vec!["/apps/sim", "-v"]);
    }

    #[test]
    fn test_mpiexec_with_sched_args_and_hostfile() {
        let args = vec!["in.bp".to_string()];
        let sched = vec![("--bind-to".to_string(), "core".to_string())];
        let mut req = request(&args, &sched);
        let hostfile = PathBuf::from("/tmp/hosts");
        req.hostfile = Some(&hostfile);

        let argv = MpiLauncher::mpiexec().without_path_lookup().wrap(&req).unwrap();
        assert_eq!(
            argv,
            vec![
                "mpiexec", "-n", "8", "--bind-to", "core", "--hostfile", "/tmp/hosts",
                "/apps/sim", "in.bp"
            ]
        );
    }

    #[test]
    fn test_aprun_tasks_per_node() {
        let argv = MpiLauncher::aprun()
            .without_path_lookup()
            .wrap(&request(&[], &[]))
            .unwrap();
        assert_eq!(argv, vec!["aprun", "-n", "8", "-N", "4", "/apps/sim"]);
    }

    #[test]
    fn test_srun_nodes() {
        let argv = MpiLauncher::srun()
            .without_path_lookup()
            .wrap(&request(&[], &[]))
            .unwrap();
        assert_eq!(argv, vec!["srun", "-n", "8", "-N", "2", "/apps/sim"]);
    }

    #[test]
    fn test_jsrun_resource_sets() {
        let argv = JsrunLauncher::new()
            .without_path_lookup()
            .wrap(&request(&[], &[]))
            .unwrap();
        assert_eq!(
            argv,
            vec!["jsrun", "-n", "2", "-a", "4", "-c", "4", "-g", "6", "-r", "1", "/apps/sim"]
        );
    }

    #[test]
    fn test_mpmd_only_for_mpiexec() {
        let reqs = [request(&[], &[]), request(&[], &[])];
        let argv = MpiLauncher::mpiexec()
            .without_path_lookup()
            .wrap_mpmd(&reqs)
            .unwrap()
            .unwrap();
        assert_eq!(argv.iter().filter(|a| *a == ":").count(), 1);
        assert_eq!(argv[0], "mpiexec");

        assert!(MpiLauncher::srun().wrap_mpmd(&reqs).is_none());
        assert!(DirectLauncher.wrap_mpmd(&reqs).is_none());
    }

    #[test]
    fn test_missing_program() {
        assert!(matches!(
            find_in_path("definitely-not-a-real-launcher-xyz"),
            Err(LauncherError::NotFound(_))
        ));
        assert!(find_in_path("sh").is_ok());
    }

    #[test]
    fn test_kind_parse_round_names() {
        for kind in [
            LauncherKind::Mpiexec,
            LauncherKind::Aprun,
            LauncherKind::Srun,
            LauncherKind::Jsrun,
            LauncherKind::None,
        ] {
            assert_eq!(LauncherKind::parse(kind.as_str()).unwrap(), kind);
            assert_eq!(kind.build().kind(), kind);
        }
        assert!(LauncherKind::parse("qsub").is_err());
    }
}
