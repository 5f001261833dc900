//! Chain orchestration scenarios: {previous} threading, chain directory,
//! progress files, and parallel-in-chain fail-fast.

mod common;

use common::{cancel_rx, echo_task_runner, engine_with, text_runner, write_script};
use convoy::domain::{
    AgentSpec, ChainStep, ParallelStep, Request, RequestKind, SequentialStep, StepResult,
};
use tempfile::TempDir;

fn seq(agent: &str, task: Option<&str>) -> ChainStep {
    ChainStep::Sequential(SequentialStep {
        agent: agent.to_string(),
        task: task.map(|t| t.to_string()),
        overrides: Default::default(),
    })
}

#[tokio::test]
async fn test_chain_threads_previous_output() {
    let tmp = TempDir::new().unwrap();
    let runner = text_runner(tmp.path(), "found 3 files");
    let (engine, _store) = engine_with(
        &tmp,
        &runner,
        vec![AgentSpec::new("scout", "m"), AgentSpec::new("planner", "m")],
    );

    // Second step has no task, so it defaults to {previous}.
    let request = Request::chain(
        vec![seq("scout", Some("scan X")), seq("planner", None)],
        tmp.path(),
    );
    let details = engine.execute(request, None, cancel_rx()).await;

    assert_eq!(details.results.len(), 2);
    assert_eq!(details.results[0].task, "scan X");
    // No output target on the planner, so the resolved task is exactly the
    // previous step's trimmed output.
    assert_eq!(details.results[1].task, "found 3 files");
    assert!(details.results.iter().all(|r| r.succeeded()));
    assert_eq!(details.chain_agents, vec!["scout", "planner"]);
}

#[tokio::test]
async fn test_chain_write_instruction_prepended() {
    let tmp = TempDir::new().unwrap();
    let runner = text_runner(tmp.path(), "found 3 files");
    let mut planner = AgentSpec::new("planner", "m");
    planner.output = Some("plan.md".to_string());
    let (engine, _store) = engine_with(
        &tmp,
        &runner,
        vec![AgentSpec::new("scout", "m"), planner],
    );

    let request = Request::chain(
        vec![seq("scout", Some("scan X")), seq("planner", None)],
        tmp.path(),
    );
    let details = engine.execute(request, None, cancel_rx()).await;

    let expected_path = tmp.path().join("plan.md");
    assert_eq!(
        details.results[1].task,
        format!("[Write to: {}]\nfound 3 files", expected_path.display())
    );
    // The stub never writes the file, which is a warning, not a failure.
    assert!(details.results[1]
        .warnings
        .iter()
        .any(|w| w.contains("was not produced")));
    assert!(details.results[1].succeeded());
}

#[tokio::test]
async fn test_chain_dir_template_expansion() {
    let tmp = TempDir::new().unwrap();
    let runner = text_runner(tmp.path(), "done");
    let (engine, _store) = engine_with(&tmp, &runner, vec![AgentSpec::new("scout", "m")]);

    let request = Request::chain(
        vec![seq("scout", Some("write notes under {chain_dir}"))],
        tmp.path(),
    );
    let details = engine.execute(request, None, cancel_rx()).await;

    let task = &details.results[0].task;
    assert!(!task.contains("{chain_dir}"), "unexpanded template: {}", task);
    // The expanded directory exists on disk under the managed chain root.
    let expanded = task.strip_prefix("write notes under ").unwrap();
    assert!(std::path::Path::new(expanded).is_dir());
    assert!(expanded.starts_with(tmp.path().join("chains-work").to_str().unwrap()));
}

#[tokio::test]
async fn test_task_variable_resolves_from_request() {
    let tmp = TempDir::new().unwrap();
    let runner = text_runner(tmp.path(), "done");
    let (engine, _store) = engine_with(&tmp, &runner, vec![AgentSpec::new("scout", "m")]);

    let mut request = Request::chain(vec![seq("scout", Some("expand on: {task}"))], tmp.path());
    if let RequestKind::Chain { task, .. } = &mut request.kind {
        *task = Some("audit the parser".to_string());
    }
    let details = engine.execute(request, None, cancel_rx()).await;
    assert_eq!(details.results[0].task, "expand on: audit the parser");
}

#[tokio::test]
async fn test_progress_file_created_and_referenced() {
    let tmp = TempDir::new().unwrap();
    let runner = text_runner(tmp.path(), "done");
    let (engine, _store) = engine_with(&tmp, &runner, vec![AgentSpec::new("scout", "m")]);

    let mut step = SequentialStep {
        agent: "scout".to_string(),
        task: Some("report as you go".to_string()),
        overrides: Default::default(),
    };
    step.overrides.progress = Some(true);

    let request = Request::chain(vec![ChainStep::Sequential(step)], tmp.path());
    let details = engine.execute(request, None, cancel_rx()).await;

    let task = &details.results[0].task;
    assert!(task.starts_with("[Progress file: "));
    let path_part = task
        .strip_prefix("[Progress file: ")
        .and_then(|rest| rest.split_once(']'))
        .map(|(path, _)| path)
        .unwrap();
    assert!(std::path::Path::new(path_part).exists());
    assert!(path_part.ends_with("progress.md"));
}

#[tokio::test]
async fn test_chain_stops_at_first_failure() {
    let tmp = TempDir::new().unwrap();
    // Task "boom" fails, everything else succeeds.
    let runner = write_script(
        tmp.path(),
        "runner.sh",
        "#!/bin/sh\nfor last in \"$@\"; do :; done\nif [ \"$last\" = \"boom\" ]; then exit 3; fi\nprintf '%s\\n' '{\"type\":\"message_end\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"ok\"}]}}'\nexit 0\n",
    );
    let (engine, _store) = engine_with(
        &tmp,
        &runner,
        vec![
            AgentSpec::new("a", "m"),
            AgentSpec::new("b", "m"),
            AgentSpec::new("c", "m"),
        ],
    );

    let request = Request::chain(
        vec![
            seq("a", Some("fine")),
            seq("b", Some("boom")),
            seq("c", Some("never runs")),
        ],
        tmp.path(),
    );
    let details = engine.execute(request, None, cancel_rx()).await;

    // The result list is truncated at the failure; downstream steps are
    // absent, not marked.
    assert_eq!(details.results.len(), 2);
    assert_eq!(details.results[0].exit_code, 0);
    assert_eq!(details.results[1].exit_code, 3);
    assert_eq!(details.total_steps, Some(3));
}

#[tokio::test]
async fn test_parallel_in_chain_fail_fast_skips_peers() {
    let tmp = TempDir::new().unwrap();
    // "fail" exits 1 immediately; "slow" sleeps long enough for the
    // fail-fast trip to land; anything else succeeds at once.
    let runner = write_script(
        tmp.path(),
        "runner.sh",
        concat!(
            "#!/bin/sh\n",
            "for last in \"$@\"; do :; done\n",
            "case \"$last\" in\n",
            "  fail) exit 1 ;;\n",
            "  slow) sleep 5; printf '%s\\n' '{\"type\":\"message_end\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"slow done\"}]}}' ;;\n",
            "  *) printf '%s\\n' '{\"type\":\"message_end\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"ok\"}]}}' ;;\n",
            "esac\n",
            "exit 0\n"
        ),
    );
    let (engine, _store) = engine_with(
        &tmp,
        &runner,
        vec![
            AgentSpec::new("scout", "m"),
            AgentSpec::new("w1", "m"),
            AgentSpec::new("w2", "m"),
            AgentSpec::new("w3", "m"),
            AgentSpec::new("reviewer", "m"),
        ],
    );

    let request = Request::chain(
        vec![
            seq("scout", Some("scan")),
            ChainStep::Parallel(ParallelStep {
                tasks: vec![
                    SequentialStep {
                        agent: "w1".to_string(),
                        task: Some("fail".to_string()),
                        overrides: Default::default(),
                    },
                    SequentialStep {
                        agent: "w2".to_string(),
                        task: Some("slow".to_string()),
                        overrides: Default::default(),
                    },
                    SequentialStep {
                        agent: "w3".to_string(),
                        task: Some("slow".to_string()),
                        overrides: Default::default(),
                    },
                ],
                concurrency: Some(2),
                fail_fast: true,
            }),
            seq("reviewer", None),
        ],
        tmp.path(),
    );
    let details = engine.execute(request, None, cancel_rx()).await;

    // scout + the three group rows; the reviewer never starts.
    assert_eq!(details.results.len(), 4);
    assert_eq!(details.results[1].agent, "w1");
    assert_eq!(details.results[1].exit_code, 1);
    assert_eq!(details.results[2].exit_code, StepResult::EXIT_SKIPPED);
    assert_eq!(details.results[3].exit_code, StepResult::EXIT_SKIPPED);
    assert!(!details.results.iter().any(|r| r.agent == "reviewer"));
    assert_eq!(details.chain_agents[1], "[w1+w2+w3]");
    assert_eq!(details.total_steps, Some(5));
}

#[tokio::test]
async fn test_parallel_in_chain_aggregates_previous() {
    let tmp = TempDir::new().unwrap();
    let runner = echo_task_runner(tmp.path());
    let (engine, _store) = engine_with(
        &tmp,
        &runner,
        vec![
            AgentSpec::new("w1", "m"),
            AgentSpec::new("w2", "m"),
            AgentSpec::new("merge", "m"),
        ],
    );

    let request = Request::chain(
        vec![
            ChainStep::Parallel(ParallelStep {
                tasks: vec![
                    SequentialStep {
                        agent: "w1".to_string(),
                        task: Some("alpha".to_string()),
                        overrides: Default::default(),
                    },
                    SequentialStep {
                        agent: "w2".to_string(),
                        task: Some("beta".to_string()),
                        overrides: Default::default(),
                    },
                ],
                concurrency: None,
                fail_fast: false,
            }),
            seq("merge", None),
        ],
        tmp.path(),
    );
    let details = engine.execute(request, None, cancel_rx()).await;

    assert_eq!(details.results.len(), 3);
    // The merge step's task is the aggregate of the group in input order.
    let merge_task = &details.results[2].task;
    assert!(merge_task.contains("=== Parallel Task 1 (w1) ==="));
    assert!(merge_task.contains("alpha"));
    assert!(merge_task.contains("=== Parallel Task 2 (w2) ==="));
    assert!(merge_task.contains("beta"));
    let first = merge_task.find("(w1)").unwrap();
    let second = merge_task.find("(w2)").unwrap();
    assert!(first < second);
}

#[tokio::test]
async fn test_empty_chain_rejected() {
    let tmp = TempDir::new().unwrap();
    let runner = text_runner(tmp.path(), "x");
    let (engine, _store) = engine_with(&tmp, &runner, vec![]);

    let details = engine
        .execute(Request::chain(vec![], tmp.path()), None, cancel_rx())
        .await;
    assert!(details.error.unwrap().contains("chain has no steps"));
}

#[tokio::test]
async fn test_first_step_requires_explicit_task() {
    let tmp = TempDir::new().unwrap();
    let runner = text_runner(tmp.path(), "x");
    let (engine, _store) = engine_with(&tmp, &runner, vec![AgentSpec::new("scout", "m")]);

    let details = engine
        .execute(
            Request::chain(vec![seq("scout", None)], tmp.path()),
            None,
            cancel_rx(),
        )
        .await;
    assert!(details
        .error
        .unwrap()
        .contains("first chain step needs an explicit task"));
}
