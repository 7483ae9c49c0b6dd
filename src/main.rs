//! Savanna CLI
//!
//! Entry point for the `savanna` pipeline engine.

use clap::Parser;
use savanna::config::{EffectiveConfig, LogLevel};
use savanna::consumer::{AdmissionError, PipelineRunner, RunnerOptions};
use savanna::launcher::LauncherKind;
use savanna::producer::PipelineReader;
use savanna::signal::{SignalHandler, EXIT_CODE_KILLED};
use savanna::status::WorkflowStatus;
use serde_json::{json, Map, Value};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "savanna")]
#[command(about = "Run HPC workflow pipelines on a fixed node allocation", version)]
struct Cli {
    /// Nodes available to the engine
    #[arg(long)]
    max_nodes: Option<u32>,

    /// MPI ranks per node
    #[arg(long)]
    processes_per_node: Option<u32>,

    /// MPI launcher used for every run
    #[arg(long, value_enum)]
    runner: Option<LauncherKind>,

    /// JSON file with the pipeline definitions
    #[arg(long)]
    producer_input_file: PathBuf,

    /// Workflow status file, created if missing
    #[arg(long)]
    status_file: Option<PathBuf>,

    #[arg(long, value_enum, ignore_case = true)]
    log_level: Option<LogLevel>,

    /// Write logs here instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// TOML settings file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Seconds between SIGTERM and SIGKILL when killing a run
    #[arg(long)]
    kill_wait_seconds: Option<u64>,

    /// Kill every pipeline when a stop-on-failure post-process hook fails
    #[arg(long)]
    kill_all_on_fatal: bool,
}

impl Cli {
    /// Only flags that were given, so lower layers keep their values.
    fn overrides(&self) -> Value {
        let mut map = Map::new();
        if let Some(n) = self.max_nodes {
            map.insert("max_nodes".into(), json!(n));
        }
        if let Some(n) = self.processes_per_node {
            map.insert("processes_per_node".into(), json!(n));
        }
        if let Some(runner) = self.runner {
            map.insert("runner".into(), json!(runner.as_str()));
        }
        if let Some(level) = self.log_level {
            map.insert("log_level".into(), json!(level));
        }
        if self.kill_all_on_fatal {
            map.insert("kill_all_on_fatal".into(), json!(true));
        }
        if let Some(secs) = self.kill_wait_seconds {
            map.insert("termination".into(), json!({"kill_wait_seconds": secs}));
        }
        Value::Object(map)
    }
}

fn main() {
    let cli = Cli::parse();

    let config = match EffectiveConfig::build(cli.config.as_deref(), Some(cli.overrides())) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(1);
        }
    };
    let settings = match config.settings() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(1);
        }
    };
    let policy = match settings.termination.policy() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = init_logging(settings.log_level, cli.log_file.as_deref()) {
        eprintln!("Error opening log file: {}", e);
        process::exit(1);
    }

    let job_id = job_id();
    tracing::info!(job = %job_id, "starting savanna job");

    let status = match &cli.status_file {
        Some(path) => match WorkflowStatus::open(path) {
            Ok(s) => Some(Arc::new(s)),
            Err(e) => {
                tracing::error!(error = %e, "could not open status file");
                eprintln!("Status file error: {}", e);
                process::exit(1);
            }
        },
        None => None,
    };

    let record_dir = cli
        .status_file
        .as_deref()
        .unwrap_or(&cli.producer_input_file)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match config.with_job_id(&job_id).write_to_dir(record_dir) {
        Ok(path) => tracing::debug!(path = %path.display(), "wrote effective config"),
        Err(e) => tracing::warn!(error = %e, "could not write effective config"),
    }

    let runner = PipelineRunner::new(RunnerOptions {
        max_nodes: settings.max_nodes,
        processes_per_node: settings.processes_per_node,
        launcher: settings.runner.build(),
        status,
        kill_all_on_fatal: settings.kill_all_on_fatal,
    });
    tracing::info!(
        max_nodes = settings.max_nodes,
        processes_per_node = settings.processes_per_node,
        runner = %settings.runner,
        "runner configured"
    );

    let signals = SignalHandler::new();
    let killer = runner.clone();
    if let Err(e) = signals.install(move || killer.kill_all()) {
        eprintln!("Error installing signal handler: {}", e);
        process::exit(1);
    }

    let scheduler = match runner.spawn() {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Error starting scheduler: {}", e);
            process::exit(1);
        }
    };

    let mut exit_code = 0;
    let mut reader = PipelineReader::new(&cli.producer_input_file, policy);
    if let Some(status) = runner.status() {
        reader = reader.with_previous_status(status.snapshot());
    }
    match reader.read_pipelines() {
        Ok(pipelines) => {
            for pipeline in pipelines {
                match runner.add_pipeline(pipeline) {
                    Ok(_) => {}
                    Err(AdmissionError::Stopped) => break,
                    // already logged with the pipeline id
                    Err(AdmissionError::Pipeline(_)) => {}
                    Err(e) => tracing::error!(error = %e, "pipeline not admitted"),
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "could not read pipelines");
            eprintln!("Producer error: {}", e);
            exit_code = 1;
        }
    }

    runner.stop();
    if scheduler.join().is_err() {
        tracing::error!("scheduler thread panicked");
        exit_code = 1;
    }

    if signals.state().is_kill_requested() {
        exit_code = EXIT_CODE_KILLED;
    }
    tracing::info!(job = %job_id, exit_code, "savanna job finished");
    process::exit(exit_code);
}

/// `RUST_LOG` wins over `--log-level` when set.
fn init_logging(level: LogLevel, log_file: Option<&Path>) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };
    let stderr_layer = log_file
        .is_none()
        .then(|| fmt::layer().with_writer(io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();
    Ok(())
}

/// Batch scheduler job id, falling back to this process id.
fn job_id() -> String {
    for (name, var) in [("SLURM", "SLURM_JOB_ID"), ("PBS", "PBS_JOBID"), ("COBALT", "COBALT_JOBID")] {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() {
                return format!("{name}:{value}");
            }
        }
    }
    format!("PID:{}", process::id())
}
