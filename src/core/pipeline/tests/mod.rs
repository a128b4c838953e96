mod runs;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{Acceptance, ChangePersistence, LogProgress, Pipeline, Plan, ProgressEvent, ProgressSink};
use crate::core::blockers::BlockerMemory;
use crate::core::ledger::{NewTask, Task, TaskLedger, TaskType};
use crate::core::store::test_datastore;
use crate::core::testing::{ScriptedModel, ScriptedTool};
use crate::core::tools::{Tool, ToolRegistry};

/// Counts accept/discard calls; optionally vetoes every acceptance.
#[derive(Default)]
pub(super) struct RecordingPersistence {
    veto: Option<String>,
    accepted: AtomicUsize,
    discarded: AtomicUsize,
}

impl RecordingPersistence {
    pub fn vetoing(reason: &str) -> Self {
        Self {
            veto: Some(reason.to_string()),
            ..Default::default()
        }
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn discarded(&self) -> usize {
        self.discarded.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangePersistence for RecordingPersistence {
    async fn accept(&self, _task: &Task) -> Result<Acceptance> {
        self.accepted.fetch_add(1, Ordering::SeqCst);
        Ok(match &self.veto {
            Some(reason) => Acceptance::Vetoed {
                reason: reason.clone(),
            },
            None => Acceptance::Kept {
                commit: Some("abc1234".to_string()),
                confidence: None,
            },
        })
    }

    async fn discard(&self, _task: &Task) -> Result<()> {
        self.discarded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(super) struct FailingSink;

#[async_trait]
impl ProgressSink for FailingSink {
    async fn emit(&self, _event: &ProgressEvent) -> Result<()> {
        Err(anyhow!("chat is down"))
    }
}

pub(super) struct Harness {
    pub ledger: Arc<TaskLedger>,
    pub memory: Arc<BlockerMemory>,
    pub model: Arc<ScriptedModel>,
    pub persistence: Arc<RecordingPersistence>,
    pub pipeline: Pipeline,
}

impl Harness {
    pub async fn task(&self, title: &str) -> Task {
        self.ledger
            .create(NewTask::new(title, TaskType::Research))
            .await
            .unwrap()
    }
}

pub(super) struct Setup {
    pub tools: Vec<Arc<ScriptedTool>>,
    pub replies: Vec<&'static str>,
    pub persistence: RecordingPersistence,
    pub progress: Option<Arc<dyn ProgressSink>>,
}

impl Setup {
    pub fn new(tools: Vec<Arc<ScriptedTool>>, replies: Vec<&'static str>) -> Self {
        Self {
            tools,
            replies,
            persistence: RecordingPersistence::default(),
            progress: None,
        }
    }

    pub fn build(self) -> Harness {
        let db = test_datastore().get_db();
        let ledger = Arc::new(TaskLedger::new(db.clone()));
        let memory = Arc::new(BlockerMemory::new(db));
        let model = Arc::new(ScriptedModel::new(self.replies));
        let persistence = Arc::new(self.persistence);

        let mut registry = ToolRegistry::new(Duration::from_secs(5));
        for tool in self.tools {
            registry.register(tool as Arc<dyn Tool>);
        }
        let progress = self.progress.unwrap_or_else(|| Arc::new(LogProgress));

        let pipeline = Pipeline::new(
            ledger.clone(),
            Arc::new(registry),
            memory.clone(),
            model.clone(),
            persistence.clone(),
            progress,
        );
        Harness {
            ledger,
            memory,
            model,
            persistence,
            pipeline,
        }
    }
}

/// The plan as last checkpointed, whatever its status.
pub(super) fn saved_plan(task: &Task) -> Plan {
    serde_json::from_value(task.checkpoint_data[super::types::PLAN_KEY].clone()).unwrap()
}
