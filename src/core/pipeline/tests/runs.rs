use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{FailingSink, RecordingPersistence, Setup, saved_plan};
use crate::core::budget::Tier;
use crate::core::ledger::{INTERRUPTED_REASON, TaskStatus};
use crate::core::pipeline::{PipelineError, Plan, PlanStatus, PlanStep, StepStatus};
use crate::core::testing::ScriptedTool;
use serde_json::Map;

const READ_PLAN: &str = r#"{"goal": "read notes", "overall_criteria": "notes read",
  "steps": [{"name": "read", "tool": "read_file", "args": {"input": "notes.md"}, "success_criteria": "non-empty"}]}"#;
const VERIFIED: &str = r#"{"verified": true, "reason": "notes were read"}"#;

#[tokio::test]
async fn verified_run_completes_with_artifacts() {
    let read = Arc::new(ScriptedTool::ok("read_file", "meeting at noon"));
    let h = Setup::new(vec![read.clone()], vec![READ_PLAN, VERIFIED]).build();
    let task = h.task("Read my notes").await;

    let report = h.pipeline.run(&task.id, &CancellationToken::new()).await.unwrap();
    assert!(report.verified);
    assert_eq!(report.commit.as_deref(), Some("abc1234"));
    assert_eq!(report.task.status, TaskStatus::Done);
    assert_eq!(read.calls(), 1);
    assert_eq!(h.model.tiers(), vec![Tier::Planning, Tier::Review]);
    assert_eq!(h.persistence.accepted(), 1);
    assert_eq!(h.persistence.discarded(), 0);

    let kinds: Vec<&str> = report.task.artifacts.iter().map(|a| a.kind.as_str()).collect();
    assert_eq!(kinds, vec!["step_output", "verification", "commit"]);
    assert_eq!(report.task.artifacts[0].value, "meeting at noon");
    assert_eq!(saved_plan(&report.task).status, PlanStatus::Verified);
}

#[tokio::test]
async fn all_steps_failing_skips_model_verification() {
    let shell = Arc::new(ScriptedTool::failing("shell", "exit status 1: boom"));
    let plan = r#"{"steps": [{"name": "a", "tool": "shell"}, {"name": "b", "tool": "shell"}]}"#;
    let h = Setup::new(vec![shell.clone()], vec![plan]).build();
    let task = h.task("Run the script").await;

    let report = h.pipeline.run(&task.id, &CancellationToken::new()).await.unwrap();
    assert!(!report.verified);
    assert_eq!(h.model.calls(), 1, "only the planner may call the model");
    assert_eq!(shell.calls(), 2);
    assert_eq!(report.task.status, TaskStatus::Failed);
    assert!(report.task.last_error.unwrap().contains("all 2 step(s) failed"));
    assert_eq!(h.persistence.discarded(), 1);
    assert_eq!(h.persistence.accepted(), 0);
}

#[tokio::test]
async fn rejected_verdict_fails_and_discards() {
    let read = Arc::new(ScriptedTool::ok("read_file", "wrong file"));
    let h = Setup::new(
        vec![read],
        vec![READ_PLAN, r#"{"verified": false, "reason": "read the wrong file"}"#],
    )
    .build();
    let task = h.task("Read my notes").await;

    let report = h.pipeline.run(&task.id, &CancellationToken::new()).await.unwrap();
    assert!(!report.verified);
    assert_eq!(report.task.status, TaskStatus::Failed);
    assert_eq!(report.task.last_error.as_deref(), Some("read the wrong file"));
    assert_eq!(h.persistence.accepted(), 0);
    assert_eq!(h.persistence.discarded(), 1);
    assert_eq!(saved_plan(&report.task).status, PlanStatus::Failed);
}

#[tokio::test]
async fn gate_veto_fails_the_task() {
    let read = Arc::new(ScriptedTool::ok("read_file", "ok"));
    let mut setup = Setup::new(vec![read], vec![READ_PLAN, VERIFIED]);
    setup.persistence = RecordingPersistence::vetoing("build failed: E0308");
    let h = setup.build();
    let task = h.task("Read my notes").await;

    let report = h.pipeline.run(&task.id, &CancellationToken::new()).await.unwrap();
    assert!(!report.verified);
    assert_eq!(report.task.status, TaskStatus::Failed);
    assert_eq!(report.task.last_error.as_deref(), Some("build failed: E0308"));
    assert_eq!(h.persistence.discarded(), 1);
}

#[tokio::test]
async fn missing_secret_parks_task_as_blocked() {
    let shell = Arc::new(ScriptedTool::failing("shell", "401 Unauthorized: set GITHUB_TOKEN"));
    let plan = r#"{"steps": [{"name": "push", "tool": "shell"}]}"#;
    let h = Setup::new(vec![shell], vec![plan]).build();
    let task = h.task("Open the PR").await;

    let report = h.pipeline.run(&task.id, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.task.status, TaskStatus::Blocked);
    assert!(report.task.block_reason.unwrap().contains("401 Unauthorized"));
}

#[tokio::test]
async fn finished_task_is_not_startable() {
    let h = Setup::new(vec![Arc::new(ScriptedTool::ok("read_file", "x"))], vec![READ_PLAN, VERIFIED])
        .build();
    let task = h.task("Once").await;
    h.pipeline.run(&task.id, &CancellationToken::new()).await.unwrap();

    let err = h.pipeline.run(&task.id, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::NotStartable(_))
    ));
    assert_eq!(h.model.calls(), 2);
    assert_eq!(h.ledger.get(&task.id).await.unwrap().unwrap().status, TaskStatus::Done);
}

#[tokio::test]
async fn malformed_plan_fails_the_task() {
    let h = Setup::new(vec![Arc::new(ScriptedTool::ok("read_file", "x"))], vec!["I would start by reading."])
        .build();
    let task = h.task("Read my notes").await;

    let err = h.pipeline.run(&task.id, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<PipelineError>(), Some(PipelineError::Plan(_))));
    let stored = h.ledger.get(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.last_error.unwrap().contains("no JSON plan"));
    assert_eq!(h.persistence.discarded(), 1);
}

#[tokio::test]
async fn resumed_task_continues_from_checkpoint_without_replanning() {
    let first = Arc::new(ScriptedTool::ok("read_file", "again"));
    let second = Arc::new(ScriptedTool::ok("shell", "built"));
    let h = Setup::new(vec![first.clone(), second.clone()], vec![VERIFIED]).build();
    let task = h.task("Read then build").await;

    let mut plan = Plan {
        goal: "read then build".to_string(),
        steps: vec![
            PlanStep::new("read", "read_file", Map::new(), "read"),
            PlanStep::new("build", "shell", Map::new(), "built"),
        ],
        overall_criteria: "both".to_string(),
        status: PlanStatus::Executing,
    };
    plan.steps[0].status = StepStatus::Done;
    plan.steps[0].output = Some("earlier output".to_string());
    plan.steps[1].status = StepStatus::Running;

    h.ledger.start(&task.id).await.unwrap();
    h.ledger.checkpoint(&task.id, plan.to_checkpoint().unwrap()).await.unwrap();
    let interrupted = h.ledger.block_interrupted().await.unwrap();
    assert_eq!(interrupted.len(), 1);

    let report = h.pipeline.run(&task.id, &CancellationToken::new()).await.unwrap();
    assert!(report.verified);
    assert_eq!(first.calls(), 0);
    assert_eq!(second.calls(), 1);
    assert_eq!(h.model.tiers(), vec![Tier::Review]);
    assert_eq!(report.task.execution_count, 2);
}

#[tokio::test]
async fn cancellation_skips_steps_and_blocks() {
    let read = Arc::new(ScriptedTool::ok("read_file", "x"));
    let h = Setup::new(vec![read.clone()], vec![READ_PLAN]).build();
    let task = h.task("Read my notes").await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = h.pipeline.run(&task.id, &cancel).await.unwrap();
    assert!(!report.verified);
    assert_eq!(read.calls(), 0);
    assert_eq!(h.model.calls(), 1);
    assert_eq!(report.task.status, TaskStatus::Blocked);
    assert_eq!(report.task.block_reason.as_deref(), Some(INTERRUPTED_REASON));
    assert_eq!(saved_plan(&report.task).steps[0].status, StepStatus::Skipped);
    assert_eq!(h.persistence.discarded(), 1);
}

#[tokio::test]
async fn progress_sink_failures_do_not_stop_the_run() {
    let mut setup = Setup::new(
        vec![Arc::new(ScriptedTool::ok("read_file", "x"))],
        vec![READ_PLAN, VERIFIED],
    );
    setup.progress = Some(Arc::new(FailingSink));
    let h = setup.build();
    let task = h.task("Read my notes").await;

    let report = h.pipeline.run(&task.id, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.task.status, TaskStatus::Done);
}
