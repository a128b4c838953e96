use serde_json::{Map, Value, json};

use super::*;
use crate::core::store::test_datastore;

fn ledger() -> TaskLedger {
    TaskLedger::new(test_datastore().get_db())
}

fn bag(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn create_starts_queued_with_empty_bags() {
    let ledger = ledger();
    let task = ledger
        .create(NewTask::new("Summarize inbox", TaskType::Research).priority(3))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.priority, 3);
    assert_eq!(task.execution_count, 0);
    assert!(task.checkpoint_data.is_empty());
    assert!(task.artifacts.is_empty());
}

#[tokio::test]
async fn checkpoint_merges_and_complete_appends_artifact() {
    let ledger = ledger();
    let task = ledger
        .create(NewTask::new("Fix flaky test", TaskType::Coding))
        .await
        .unwrap();
    ledger.start(&task.id).await.unwrap().unwrap();
    ledger.checkpoint(&task.id, bag(json!({"x": 1}))).await.unwrap().unwrap();
    ledger.checkpoint(&task.id, bag(json!({"y": 2}))).await.unwrap().unwrap();
    let done = ledger
        .complete(&task.id, vec![Artifact::new("text", "summary", "all green")])
        .await
        .unwrap()
        .unwrap();

    assert_eq!(done.status, TaskStatus::Done);
    assert_eq!(done.checkpoint_data.get("x"), Some(&json!(1)));
    assert_eq!(done.checkpoint_data.get("y"), Some(&json!(2)));
    assert_eq!(done.artifacts.len(), 1);
    assert_eq!(done.artifacts[0].label, "summary");
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn checkpoint_overwrites_existing_key_only() {
    let ledger = ledger();
    let task = ledger.create(NewTask::new("t", TaskType::General)).await.unwrap();
    ledger.start(&task.id).await.unwrap();
    ledger
        .checkpoint(&task.id, bag(json!({"phase": "planned", "keep": true})))
        .await
        .unwrap();
    let t = ledger
        .checkpoint(&task.id, bag(json!({"phase": "executing"})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(t.checkpoint_data.get("phase"), Some(&json!("executing")));
    assert_eq!(t.checkpoint_data.get("keep"), Some(&json!(true)));
}

#[tokio::test]
async fn illegal_transitions_return_none_and_leave_state_intact() {
    let ledger = ledger();
    let task = ledger.create(NewTask::new("t", TaskType::General)).await.unwrap();

    // queued: cannot complete, fail, block, resume or checkpoint
    assert!(ledger.complete(&task.id, vec![]).await.unwrap().is_none());
    assert!(ledger.fail(&task.id, "boom").await.unwrap().is_none());
    assert!(ledger.block(&task.id, "why").await.unwrap().is_none());
    assert!(ledger.resume(&task.id).await.unwrap().is_none());
    assert!(
        ledger
            .checkpoint(&task.id, bag(json!({"a": 1})))
            .await
            .unwrap()
            .is_none()
    );

    let unchanged = ledger.get(&task.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, TaskStatus::Queued);
    assert!(unchanged.checkpoint_data.is_empty());

    ledger.start(&task.id).await.unwrap().unwrap();
    ledger.complete(&task.id, vec![]).await.unwrap().unwrap();

    // done is terminal
    assert!(ledger.start(&task.id).await.unwrap().is_none());
    assert!(ledger.resume(&task.id).await.unwrap().is_none());
    assert!(ledger.fail(&task.id, "late").await.unwrap().is_none());
    let done = ledger.get(&task.id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Done);
    assert!(done.last_error.is_none());
}

#[tokio::test]
async fn start_is_single_flight() {
    let ledger = ledger();
    let task = ledger.create(NewTask::new("t", TaskType::General)).await.unwrap();
    assert!(ledger.start(&task.id).await.unwrap().is_some());
    assert!(ledger.start(&task.id).await.unwrap().is_none());
    let t = ledger.get(&task.id).await.unwrap().unwrap();
    assert_eq!(t.execution_count, 1);
}

#[tokio::test]
async fn blocked_task_can_resume_and_restart() {
    let ledger = ledger();
    let task = ledger.create(NewTask::new("t", TaskType::General)).await.unwrap();
    ledger.start(&task.id).await.unwrap();
    let blocked = ledger.block(&task.id, "needs token").await.unwrap().unwrap();
    assert_eq!(blocked.status_reason(), Some("needs token"));

    let queued = ledger.resume(&task.id).await.unwrap().unwrap();
    assert_eq!(queued.status, TaskStatus::Queued);
    assert!(queued.block_reason.is_none());

    let running = ledger.start(&task.id).await.unwrap().unwrap();
    assert_eq!(running.execution_count, 2);
}

#[tokio::test]
async fn failed_task_resumes_to_queued() {
    let ledger = ledger();
    let task = ledger.create(NewTask::new("t", TaskType::General)).await.unwrap();
    ledger.start(&task.id).await.unwrap();
    let failed = ledger.fail(&task.id, "tool exploded").await.unwrap().unwrap();
    assert_eq!(failed.status_reason(), Some("tool exploded"));
    let queued = ledger.resume(&task.id).await.unwrap().unwrap();
    assert_eq!(queued.status, TaskStatus::Queued);
}

#[tokio::test]
async fn unknown_id_is_none_everywhere() {
    let ledger = ledger();
    assert!(ledger.get("nope").await.unwrap().is_none());
    assert!(ledger.start("nope").await.unwrap().is_none());
    assert!(
        ledger
            .add_artifact("nope", Artifact::new("text", "l", "v"))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn next_queued_prefers_priority_then_age() {
    let ledger = ledger();
    let low = ledger.create(NewTask::new("low", TaskType::General)).await.unwrap();
    let high = ledger
        .create(NewTask::new("high", TaskType::General).priority(10))
        .await
        .unwrap();
    let next = ledger.next_queued().await.unwrap().unwrap();
    assert_eq!(next.id, high.id);
    ledger.start(&high.id).await.unwrap();
    let next = ledger.next_queued().await.unwrap().unwrap();
    assert_eq!(next.id, low.id);
}

#[tokio::test]
async fn interrupted_tasks_are_blocked_not_resumed() {
    let ledger = ledger();
    let task = ledger.create(NewTask::new("t", TaskType::General)).await.unwrap();
    ledger.start(&task.id).await.unwrap();
    assert_eq!(ledger.interrupted().await.unwrap().len(), 1);

    let blocked = ledger.block_interrupted().await.unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].block_reason.as_deref(), Some(INTERRUPTED_REASON));
    assert!(ledger.interrupted().await.unwrap().is_empty());
    assert!(ledger.next_queued().await.unwrap().is_none());
}

#[tokio::test]
async fn queries_by_status_parent_and_counts() {
    let ledger = ledger();
    let parent = ledger.create(NewTask::new("parent", TaskType::General)).await.unwrap();
    let child = ledger
        .create(NewTask::new("child", TaskType::Research).parent(&parent.id))
        .await
        .unwrap();
    ledger.start(&parent.id).await.unwrap();

    let subs = ledger.subtasks(&parent.id).await.unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].id, child.id);

    assert_eq!(ledger.active().await.unwrap().len(), 2);
    let counts = ledger.status_counts().await.unwrap();
    assert_eq!(counts[&TaskStatus::Queued], 1);
    assert_eq!(counts[&TaskStatus::Running], 1);
    assert_eq!(counts[&TaskStatus::Done], 0);
}

#[test]
fn state_machine_edges() {
    use TaskStatus::*;
    let allowed = [
        (Queued, Running),
        (Running, Blocked),
        (Running, Done),
        (Running, Failed),
        (Blocked, Queued),
        (Blocked, Running),
        (Blocked, Done),
        (Blocked, Failed),
        (Failed, Queued),
    ];
    for from in TaskStatus::ALL {
        for to in TaskStatus::ALL {
            assert_eq!(
                can_transition(from, to),
                allowed.contains(&(from, to)),
                "unexpected verdict for {:?} -> {:?}",
                from,
                to
            );
        }
    }
}

#[test]
fn guards_follow_the_state_machine() {
    assert_eq!(sources_of(TaskStatus::Running), "'queued', 'blocked'");
    assert_eq!(sources_of(TaskStatus::Blocked), "'running'");
    assert_eq!(sources_of(TaskStatus::Done), "'running', 'blocked'");
    assert_eq!(sources_of(TaskStatus::Queued), "'blocked', 'failed'");
    assert_eq!(sources_of(TaskStatus::Failed), "'running', 'blocked'");
}

#[tokio::test]
async fn finished_tasks_take_no_artifacts() {
    let ledger = ledger();
    let task = ledger.create(NewTask::new("t", TaskType::General)).await.unwrap();
    let note = || Artifact::new("text", "note", "v");
    assert!(ledger.add_artifact(&task.id, note()).await.unwrap().is_none());

    ledger.start(&task.id).await.unwrap();
    let running = ledger.add_artifact(&task.id, note()).await.unwrap().unwrap();
    assert_eq!(running.artifacts.len(), 1);

    ledger.complete(&task.id, vec![]).await.unwrap().unwrap();
    assert!(ledger.add_artifact(&task.id, note()).await.unwrap().is_none());
    let done = ledger.get(&task.id).await.unwrap().unwrap();
    assert_eq!(done.artifacts.len(), 1);
    assert_eq!(done.status, TaskStatus::Done);
}
