//! Background worker and registry scenarios: durable status protocol,
//! result-file ordering, and exactly-once completion dispatch.

mod common;

use std::path::Path;

use common::{echo_task_runner, write_script};
use convoy::background::{
    self, BackgroundRegistry, SubagentEvent, WorkerInput, WorkerStep,
};
use convoy::domain::{ExtensionPolicy, JobState, StepState};
use convoy::runner::ResolvedStep;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn resolved(agent: &str, task: &str) -> ResolvedStep {
    ResolvedStep {
        agent: agent.to_string(),
        model: "m".to_string(),
        task: task.to_string(),
        system_prompt: String::new(),
        skills: vec![],
        tools: vec![],
        mcp_direct_tools: None,
        extensions: ExtensionPolicy::Inherit,
        output_file: None,
        progress: false,
        warnings: vec![],
    }
}

fn worker_input(tmp: &TempDir, runner: &Path, id: &str, steps: Vec<WorkerStep>) -> WorkerInput {
    WorkerInput {
        id: id.to_string(),
        mode: if steps.len() > 1 { "chain" } else { "single" }.to_string(),
        steps,
        result_path: tmp.path().join(format!("results/{}.json", id)),
        cwd: tmp.path().to_path_buf(),
        placeholder: "{previous}".to_string(),
        runner: runner.to_path_buf(),
        max_output: None,
        artifacts_dir: None,
        capture_events: false,
        session_dir: None,
        async_dir: tmp.path().join(format!("async/{}", id)),
        chain_dir: None,
        session_id: Some("session-1".to_string()),
    }
}

#[tokio::test]
async fn test_two_step_chain_completes_durably() {
    let tmp = TempDir::new().unwrap();
    let runner = echo_task_runner(tmp.path());
    let input = worker_input(
        &tmp,
        &runner,
        "run-bg-1",
        vec![
            WorkerStep::Sequential(resolved("scout", "alpha")),
            WorkerStep::Sequential(resolved("planner", "{previous}")),
        ],
    );
    let async_dir = input.async_dir.clone();
    let result_path = input.result_path.clone();

    background::run_worker_input(input).await.unwrap();

    // Terminal status precedes the result file; both exist afterwards.
    let status = background::read_status(&async_dir).unwrap();
    assert_eq!(status.state, JobState::Complete);
    assert_eq!(status.steps.len(), 2);
    assert!(status
        .steps
        .iter()
        .all(|s| s.status == StepState::Complete));
    assert_eq!(status.current_step, 2);
    assert!(status.total_tokens.is_some());
    for step in &status.steps {
        assert!(step.ended_at.unwrap() >= step.started_at.unwrap());
    }

    let result = background::read_result(&result_path).unwrap();
    assert!(result.success);
    assert_eq!(result.results.len(), 2);
    // The worker substituted {previous} with the first step's output.
    assert_eq!(result.results[1].output, "alpha");
    assert_eq!(result.exit_code, 0);

    // Per-step logs and the markdown summary are on disk.
    assert!(async_dir.join("output-0.log").exists());
    assert!(async_dir.join("output-1.log").exists());
    assert!(async_dir.join("subagent-log-run-bg-1.md").exists());

    // The event timeline is strictly time-ordered and bracketed.
    let events = background::read_events(&async_dir).unwrap();
    assert_eq!(events.first().unwrap().event, "subagent.run.started");
    assert_eq!(events.last().unwrap().event, "subagent.run.completed");
    for pair in events.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
    assert_eq!(
        events
            .iter()
            .filter(|e| e.event == "subagent.step.completed")
            .count(),
        2
    );
}

#[tokio::test]
async fn test_failed_step_marks_run_failed() {
    let tmp = TempDir::new().unwrap();
    let runner = write_script(
        tmp.path(),
        "runner.sh",
        "#!/bin/sh\nfor last in \"$@\"; do :; done\nif [ \"$last\" = \"boom\" ]; then exit 7; fi\nprintf '%s\\n' '{\"type\":\"message_end\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"ok\"}]}}'\nexit 0\n",
    );
    let input = worker_input(
        &tmp,
        &runner,
        "run-bg-2",
        vec![
            WorkerStep::Sequential(resolved("a", "fine")),
            WorkerStep::Sequential(resolved("b", "boom")),
            WorkerStep::Sequential(resolved("c", "never")),
        ],
    );
    let async_dir = input.async_dir.clone();
    let result_path = input.result_path.clone();

    background::run_worker_input(input).await.unwrap();

    let status = background::read_status(&async_dir).unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.steps[0].status, StepState::Complete);
    assert_eq!(status.steps[1].status, StepState::Failed);
    assert_eq!(status.steps[1].exit_code, Some(7));
    // The third step never started.
    assert_eq!(status.steps[2].status, StepState::Pending);
    assert_eq!(status.current_step, 1);
    assert!(status.error.is_some());

    let result = background::read_result(&result_path).unwrap();
    assert!(!result.success);
    assert_eq!(result.exit_code, 7);
    assert_eq!(result.results.len(), 2);
}

#[tokio::test]
async fn test_parallel_group_fail_fast_rows() {
    let tmp = TempDir::new().unwrap();
    let runner = write_script(
        tmp.path(),
        "runner.sh",
        concat!(
            "#!/bin/sh\n",
            "for last in \"$@\"; do :; done\n",
            "case \"$last\" in\n",
            "  fail) exit 1 ;;\n",
            "  slow) sleep 5 ;;\n",
            "esac\n",
            "printf '%s\\n' '{\"type\":\"message_end\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"ok\"}]}}'\n",
            "exit 0\n"
        ),
    );
    let input = worker_input(
        &tmp,
        &runner,
        "run-bg-3",
        vec![WorkerStep::Parallel {
            parallel: vec![
                resolved("w1", "fail"),
                resolved("w2", "slow"),
                resolved("w3", "slow"),
            ],
            concurrency: Some(2),
            fail_fast: true,
        }],
    );
    let async_dir = input.async_dir.clone();
    let result_path = input.result_path.clone();

    background::run_worker_input(input).await.unwrap();

    let status = background::read_status(&async_dir).unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.steps.len(), 3);
    assert_eq!(status.steps[0].exit_code, Some(1));
    // Fail-fast peers land as failed rows with the skip exit code.
    assert_eq!(status.steps[1].exit_code, Some(-1));
    assert_eq!(status.steps[2].exit_code, Some(-1));

    let result = background::read_result(&result_path).unwrap();
    assert!(result.results[1].skipped);
    assert!(result.results[2].skipped);
}

#[tokio::test]
async fn test_registry_dispatches_completion_exactly_once() {
    let tmp = TempDir::new().unwrap();
    let runner = echo_task_runner(tmp.path());
    let input = worker_input(
        &tmp,
        &runner,
        "run-bg-4",
        vec![WorkerStep::Sequential(resolved("scout", "alpha"))],
    );
    let async_dir = input.async_dir.clone();
    let result_path = input.result_path.clone();

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let registry = BackgroundRegistry::new(
        tmp.path().join("results"),
        tmp.path().to_path_buf(),
        Some("session-1".to_string()),
        event_tx,
    );
    registry.register("run-bg-4", async_dir.clone(), vec!["scout".to_string()], 0);
    match event_rx.try_recv().unwrap() {
        SubagentEvent::Started { id, .. } => assert_eq!(id, "run-bg-4"),
        other => panic!("unexpected event: {:?}", other),
    }

    background::run_worker_input(input).await.unwrap();
    assert!(result_path.exists());

    // Poll picks up the terminal status; the scan dispatches completion.
    registry.tick();
    registry.scan_results();

    match event_rx.try_recv().unwrap() {
        SubagentEvent::Complete { id, success, .. } => {
            assert_eq!(id, "run-bg-4");
            assert!(success);
        }
        other => panic!("unexpected event: {:?}", other),
    }
    // The result file is consumed on dispatch, and a second scan emits
    // nothing.
    assert!(!result_path.exists());
    registry.scan_results();
    assert!(event_rx.try_recv().is_err());

    let job = &registry.jobs()[0];
    assert_eq!(job.status.as_ref().unwrap().state, JobState::Complete);
    registry.shutdown();
}
