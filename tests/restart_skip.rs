//! Restarting a campaign in place skips pipelines already done.

use std::fs;
use std::sync::Arc;

use savanna::consumer::{PipelineRunner, RunnerOptions};
use savanna::launcher::DirectLauncher;
use savanna::producer::PipelineReader;
use savanna::state::{PipelineState, Reason};
use savanna::status::{WorkflowStatus, STATUS_FILE_NAME};
use savanna::timeout::TerminationPolicy;
use serde_json::json;
use tempfile::TempDir;

#[test]
fn test_done_pipeline_not_rerun() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let status_path = root.join(STATUS_FILE_NAME);
    fs::write(
        &status_path,
        json!({
            "7": {"state": "done", "reason": "succeeded", "return_codes": {"main": 0}},
            "8": {"state": "killed", "reason": null, "return_codes": {}}
        })
        .to_string(),
    )
    .unwrap();

    let input = root.join("pipelines.json");
    let pipeline = |id: u32| {
        json!({
            "id": id,
            "working_dir": root.join(id.to_string()),
            "runs": [{"name": "main", "exe": "/bin/true"}]
        })
    };
    fs::write(&input, json!([pipeline(7), pipeline(8)]).to_string()).unwrap();

    let pipelines = PipelineReader::new(&input, TerminationPolicy::quick())
        .read_pipelines()
        .unwrap();
    let ids: Vec<&str> = pipelines.iter().map(|p| p.id()).collect();
    assert_eq!(ids, vec!["8"]);

    let status = Arc::new(WorkflowStatus::open(&status_path).unwrap());
    let runner = PipelineRunner::new(RunnerOptions {
        max_nodes: 1,
        processes_per_node: 1,
        launcher: Arc::new(DirectLauncher),
        status: Some(Arc::clone(&status)),
        kill_all_on_fatal: false,
    });
    let scheduler = runner.spawn().unwrap();
    for p in pipelines {
        runner.add_pipeline(p).unwrap();
    }
    runner.stop();
    scheduler.join().unwrap();

    // The earlier record survives the rewrite.
    let reopened = WorkflowStatus::open(&status_path).unwrap();
    let seven = reopened.get("7").unwrap();
    assert_eq!(seven.reason, Some(Reason::Succeeded));
    assert!(!root.join("7").exists());

    let eight = reopened.get("8").unwrap();
    assert_eq!(eight.state, PipelineState::Done);
    assert_eq!(eight.reason, Some(Reason::Succeeded));
    assert_eq!(eight.return_codes["main"], Some(0));
}
