//! End-to-end runner behaviour against real processes.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use savanna::consumer::{Admission, AdmissionError, PipelineRunner, RunnerOptions};
use savanna::launcher::DirectLauncher;
use savanna::outputs::INVENTORY_FILE_NAME;
use savanna::pipeline::Pipeline;
use savanna::producer::PipelineReader;
use savanna::state::PipelineState;
use savanna::status::{WorkflowStatus, STATUS_FILE_NAME};
use savanna::timeout::TerminationPolicy;
use serde_json::{json, Value};
use tempfile::TempDir;

fn options(max_nodes: u32, status: &Arc<WorkflowStatus>) -> RunnerOptions {
    RunnerOptions {
        max_nodes,
        processes_per_node: 4,
        launcher: Arc::new(DirectLauncher),
        status: Some(Arc::clone(status)),
        kill_all_on_fatal: false,
    }
}

fn runner(max_nodes: u32, status: &Arc<WorkflowStatus>) -> PipelineRunner {
    PipelineRunner::new(options(max_nodes, status))
}

fn read_pipelines(dir: &Path, pipelines: Value) -> Vec<Arc<Pipeline>> {
    let input = dir.join("pipelines.json");
    fs::write(&input, pipelines.to_string()).unwrap();
    PipelineReader::new(&input, TerminationPolicy::quick())
        .read_pipelines()
        .unwrap()
}

fn status_json(status: &WorkflowStatus) -> Value {
    serde_json::from_str(&fs::read_to_string(status.path()).unwrap()).unwrap()
}

fn wait_until(what: &str, mut ready: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !ready() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

fn sh_pipeline(dir: &Path, id: &str, script: &str) -> Value {
    json!({
        "id": id,
        "working_dir": dir.join(id),
        "runs": [{"name": "main", "exe": "/bin/sh", "args": ["-c", script]}]
    })
}

#[test]
fn test_campaign_records_every_outcome() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let pipelines = read_pipelines(
        root,
        json!([
            {
                "id": "ok",
                "working_dir": root.join("ok"),
                "runs": [{
                    "name": "sim",
                    "exe": "/bin/sh",
                    "args": ["-c", "mkdir -p out.bp && printf 12345 > out.bp/data.0"]
                }]
            },
            {
                "id": "huge",
                "working_dir": root.join("huge"),
                "runs": [{"name": "sim", "exe": "/bin/true", "nprocs": 64}]
            },
            sh_pipeline(root, "bad", "exit 3")
        ]),
    );
    assert_eq!(pipelines.len(), 3);

    let status = Arc::new(WorkflowStatus::open(root.join(STATUS_FILE_NAME)).unwrap());
    let runner = runner(2, &status);
    let scheduler = runner.spawn().unwrap();

    let admissions: Vec<Admission> = pipelines
        .into_iter()
        .map(|p| runner.add_pipeline(p).unwrap())
        .collect();
    assert_eq!(
        admissions,
        vec![
            Admission::Queued { cost: 1 },
            Admission::NoFit { cost: 16 },
            Admission::Queued { cost: 1 },
        ]
    );

    runner.stop();
    scheduler.join().unwrap();

    let written = status_json(&status);
    assert_eq!(written["ok"]["state"], "done");
    assert_eq!(written["ok"]["reason"], "succeeded");
    assert_eq!(written["ok"]["return_codes"], json!({"sim": 0}));
    assert_eq!(written["huge"]["reason"], "nofit");
    assert_eq!(written["bad"]["state"], "done");
    assert_eq!(written["bad"]["reason"], "failed");
    assert_eq!(written["bad"]["return_codes"], json!({"main": 3}));

    let inventory: Value =
        serde_json::from_str(&fs::read_to_string(root.join("ok").join(INVENTORY_FILE_NAME)).unwrap()).unwrap();
    assert_eq!(inventory, json!({"out.bp": "5"}));
    assert_eq!(
        fs::read_to_string(root.join("ok/codar.workflow.return.sim")).unwrap().trim(),
        "0"
    );
    assert!(!root.join("huge").exists());
    assert_eq!(runner.free_nodes(), 2);
}

#[test]
fn test_kill_all_stops_running_and_queued() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let mut pipelines = read_pipelines(
        root,
        json!([sh_pipeline(root, "long", "sleep 30"), sh_pipeline(root, "later", "true")]),
    );
    let later = pipelines.pop().unwrap();
    let long = pipelines.pop().unwrap();

    let status = Arc::new(WorkflowStatus::open(root.join(STATUS_FILE_NAME)).unwrap());
    let runner = runner(1, &status);
    let scheduler = runner.spawn().unwrap();

    runner.add_pipeline(Arc::clone(&long)).unwrap();
    wait_until("long to spawn", || {
        long.launched_runs().first().is_some_and(|r| r.pgid().is_some())
    });
    runner.add_pipeline(later).unwrap();

    let started = Instant::now();
    runner.kill_all();
    scheduler.join().unwrap();
    assert!(started.elapsed() < Duration::from_secs(20));

    assert!(runner.is_killed());
    let written = status_json(&status);
    assert_eq!(written["long"]["state"], "killed");
    assert_eq!(written["later"]["state"], "not_started");
    assert!(matches!(
        runner.add_pipeline(read_pipelines(root, json!([sh_pipeline(root, "new", "true")])).remove(0)),
        Err(AdmissionError::Stopped)
    ));
}

/// `long` sleeps; `pp` succeeds but its stop-on-failure hook exits 1.
fn fatal_campaign(root: &Path) -> (Arc<Pipeline>, Arc<Pipeline>) {
    let mut pipelines = read_pipelines(
        root,
        json!([
            sh_pipeline(root, "long", "sleep 30"),
            {
                "id": "pp",
                "working_dir": root.join("pp"),
                "post_process_script": "/bin/sh",
                "post_process_args": ["-c", "exit 1"],
                "post_process_stop_on_failure": true,
                "runs": [{"name": "main", "exe": "/bin/true"}]
            }
        ]),
    );
    let pp = pipelines.pop().unwrap();
    let long = pipelines.pop().unwrap();
    (long, pp)
}

#[test]
fn test_fatal_post_process_kills_campaign() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let (long, pp) = fatal_campaign(root);

    let status = Arc::new(WorkflowStatus::open(root.join(STATUS_FILE_NAME)).unwrap());
    let runner = PipelineRunner::new(RunnerOptions {
        kill_all_on_fatal: true,
        ..options(2, &status)
    });
    let scheduler = runner.spawn().unwrap();

    runner.add_pipeline(Arc::clone(&long)).unwrap();
    wait_until("long to spawn", || {
        long.launched_runs().first().is_some_and(|r| r.pgid().is_some())
    });
    runner.add_pipeline(pp).unwrap();
    wait_until("kill_all", || runner.is_killed());

    runner.stop();
    scheduler.join().unwrap();

    let written = status_json(&status);
    assert_eq!(written["pp"]["state"], "done");
    assert_eq!(written["pp"]["reason"], "succeeded");
    assert_eq!(written["long"]["state"], "killed");
}

#[test]
fn test_fatal_post_process_spares_others_by_default() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let (long, pp) = fatal_campaign(root);

    let status = Arc::new(WorkflowStatus::open(root.join(STATUS_FILE_NAME)).unwrap());
    let runner = runner(2, &status);
    let scheduler = runner.spawn().unwrap();

    runner.add_pipeline(Arc::clone(&long)).unwrap();
    wait_until("long to spawn", || {
        long.launched_runs().first().is_some_and(|r| r.pgid().is_some())
    });
    runner.add_pipeline(Arc::clone(&pp)).unwrap();
    wait_until("pp to finish", || {
        status.get("pp").is_some_and(|r| r.state == PipelineState::Done)
    });
    // returns once the failing hook and its fatal callback are through
    pp.join();

    assert!(!runner.is_killed());
    assert_eq!(runner.running(), vec!["long".to_string()]);
    assert_eq!(status.get("long").unwrap().state, PipelineState::Running);

    runner.kill_all();
    scheduler.join().unwrap();
    assert_eq!(status_json(&status)["long"]["state"], "killed");
}
