//! End-to-end engine scenarios against a stub runner.

mod common;

use common::{cancel_rx, engine_with, text_runner, write_script};
use convoy::domain::{AgentSpec, Request, StepResult};
use tempfile::TempDir;

#[tokio::test]
async fn test_single_success() {
    let tmp = TempDir::new().unwrap();
    let runner = text_runner(tmp.path(), "world");
    let (engine, _store) = engine_with(
        &tmp,
        &runner,
        vec![AgentSpec::new("scout", "anthropic/claude-opus-4")],
    );

    let request = Request::single("scout", "hello", tmp.path());
    let details = engine.execute(request, None, cancel_rx()).await;

    assert!(details.error.is_none(), "unexpected error: {:?}", details.error);
    assert_eq!(details.mode, "single");
    assert_eq!(details.results.len(), 1);
    assert_eq!(details.results[0].exit_code, 0);
    assert_eq!(details.results[0].output, "world");
    assert_eq!(details.results[0].usage.total_tokens, 15);
}

#[tokio::test]
async fn test_single_records_history_and_artifacts() {
    let tmp = TempDir::new().unwrap();
    let runner = text_runner(tmp.path(), "world");
    let (engine, _store) = engine_with(
        &tmp,
        &runner,
        vec![AgentSpec::new("scout", "anthropic/claude-opus-4")],
    );

    let details = engine
        .execute(Request::single("scout", "hello", tmp.path()), None, cancel_rx())
        .await;

    let result = &details.results[0];
    assert_eq!(result.artifact_paths.len(), 3);
    for path in &result.artifact_paths {
        assert!(path.exists(), "missing artifact {}", path.display());
    }

    let history = engine.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].agent, "scout");
    assert_eq!(history[0].exit_code, 0);
}

#[tokio::test]
async fn test_unknown_agent_lists_available() {
    let tmp = TempDir::new().unwrap();
    let runner = text_runner(tmp.path(), "x");
    let (engine, _store) = engine_with(
        &tmp,
        &runner,
        vec![
            AgentSpec::new("scout", "m"),
            AgentSpec::new("planner", "m"),
        ],
    );

    let details = engine
        .execute(Request::single("ghost", "task", tmp.path()), None, cancel_rx())
        .await;

    let error = details.error.expect("expected a validation error");
    assert!(error.contains("unknown agent 'ghost'"));
    assert!(error.contains("planner, scout"));
    assert!(details.results.is_empty());
}

#[tokio::test]
async fn test_parallel_fanout_order_and_failure_blocks() {
    let tmp = TempDir::new().unwrap();
    // Task "x" fails with exit 2; anything else prints ok.
    let runner = write_script(
        tmp.path(),
        "runner.sh",
        "#!/bin/sh\nfor last in \"$@\"; do :; done\nif [ \"$last\" = \"x\" ]; then exit 2; fi\nprintf '%s\\n' '{\"type\":\"message_end\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"ok\"}]}}'\nexit 0\n",
    );
    let (engine, _store) = engine_with(
        &tmp,
        &runner,
        vec![AgentSpec::new("a", "m"), AgentSpec::new("b", "m")],
    );

    let request = Request::parallel(
        vec![
            convoy::domain::TaskSpec {
                agent: "a".to_string(),
                task: "x".to_string(),
                overrides: Default::default(),
            },
            convoy::domain::TaskSpec {
                agent: "b".to_string(),
                task: "y".to_string(),
                overrides: Default::default(),
            },
        ],
        tmp.path(),
    );
    let details = engine.execute(request, None, cancel_rx()).await;

    assert_eq!(details.mode, "parallel");
    assert_eq!(details.results.len(), 2);
    // Input order is preserved regardless of completion order.
    assert_eq!(details.results[0].agent, "a");
    assert_eq!(details.results[1].agent, "b");
    assert_eq!(details.results[0].exit_code, 2);
    assert_eq!(details.results[1].exit_code, 0);

    let aggregate = details.output.unwrap();
    let first = aggregate.find("=== Task 1 (a) ===").unwrap();
    let second = aggregate.find("=== Task 2 (b) ===").unwrap();
    assert!(first < second);
    assert!(aggregate.contains("⚠️ FAILED (exit code 2)"));
    assert!(aggregate.contains("ok"));
}

#[tokio::test]
async fn test_parallel_background_downgrades_with_note() {
    let tmp = TempDir::new().unwrap();
    let runner = text_runner(tmp.path(), "ok");
    let (engine, _store) = engine_with(&tmp, &runner, vec![AgentSpec::new("a", "m")]);

    let mut request = Request::parallel(
        vec![convoy::domain::TaskSpec {
            agent: "a".to_string(),
            task: "t".to_string(),
            overrides: Default::default(),
        }],
        tmp.path(),
    );
    request.background = true;

    let details = engine.execute(request, None, cancel_rx()).await;
    assert!(details.async_id.is_none(), "parallel must not detach");
    assert_eq!(details.results.len(), 1);
    assert!(details.note.unwrap().contains("foreground"));
}

#[tokio::test]
async fn test_recovered_tool_error_keeps_success() {
    let tmp = TempDir::new().unwrap();
    // Tool error followed by a final text response: recovered.
    let runner = write_script(
        tmp.path(),
        "runner.sh",
        concat!(
            "#!/bin/sh\n",
            "printf '%s\\n' '{\"type\":\"tool_result_end\",\"tool_name\":\"read\",\"content\":\"ok\",\"is_error\":false}'\n",
            "printf '%s\\n' '{\"type\":\"tool_result_end\",\"tool_name\":\"read\",\"content\":\"EISDIR\",\"is_error\":true}'\n",
            "printf '%s\\n' '{\"type\":\"message_end\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"Complete review of the directory layout.\"}]}}'\n",
            "exit 0\n"
        ),
    );
    let (engine, _store) = engine_with(&tmp, &runner, vec![AgentSpec::new("scout", "m")]);

    let details = engine
        .execute(Request::single("scout", "review", tmp.path()), None, cancel_rx())
        .await;
    assert_eq!(details.results[0].exit_code, 0);
    assert!(details.results[0].error.is_none());
}

#[tokio::test]
async fn test_trailing_tool_error_overrides_success() {
    let tmp = TempDir::new().unwrap();
    // Text first, then an unrecovered tool error: the run fails.
    let runner = write_script(
        tmp.path(),
        "runner.sh",
        concat!(
            "#!/bin/sh\n",
            "printf '%s\\n' '{\"type\":\"message_end\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"Checking the file.\"}]}}'\n",
            "printf '%s\\n' '{\"type\":\"tool_result_end\",\"tool_name\":\"bash\",\"content\":\"boom\",\"is_error\":true}'\n",
            "exit 0\n"
        ),
    );
    let (engine, _store) = engine_with(&tmp, &runner, vec![AgentSpec::new("scout", "m")]);

    let details = engine
        .execute(Request::single("scout", "check", tmp.path()), None, cancel_rx())
        .await;
    assert_eq!(details.results[0].exit_code, 1);
    assert!(details.results[0].error.as_deref().unwrap().contains("bash"));
}

#[tokio::test]
async fn test_output_truncation_with_marker() {
    let tmp = TempDir::new().unwrap();
    // 60 bytes of text against a 32-byte cap.
    let runner = text_runner(tmp.path(), &"a".repeat(60));
    let (engine, _store) = engine_with(&tmp, &runner, vec![AgentSpec::new("scout", "m")]);

    let mut request = Request::single("scout", "emit", tmp.path());
    request.max_output = Some(32);

    let details = engine.execute(request, None, cancel_rx()).await;
    let result = &details.results[0];
    let truncation = result.truncation.as_ref().expect("expected truncation");
    assert!(truncation.was_truncated);
    assert!(result.output.contains("…truncated"));
    // The untruncated body is preserved in the output artifact.
    let saved = truncation.saved_to.as_ref().unwrap();
    assert_eq!(std::fs::read_to_string(saved).unwrap().len(), 60);
}

#[tokio::test]
async fn test_skipped_result_constant() {
    // Pinned: aggregation and status rows rely on these values.
    assert_eq!(StepResult::EXIT_SKIPPED, -1);
    assert_eq!(StepResult::EXIT_CANCELLED, -2);
}

#[tokio::test]
async fn test_spawn_failure_is_step_result_not_panic() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("does-not-exist.sh");
    let (engine, _store) = engine_with(&tmp, &missing, vec![AgentSpec::new("scout", "m")]);

    let details = engine
        .execute(Request::single("scout", "task", tmp.path()), None, cancel_rx())
        .await;
    let result = &details.results[0];
    assert_ne!(result.exit_code, 0);
    assert!(result.error.as_deref().unwrap().contains("spawn"));
}
