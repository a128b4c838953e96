//! Task → plan → tool execution → verification → persist or discard.
//!
//! Every phase change is checkpointed into the task's data bag under
//! `plan`, so a restart mid-run can report exactly where the task stopped
//! and a resumed task continues from its last finished step.

pub mod executor;
pub mod persistence;
pub mod planner;
pub mod types;
pub mod verifier;

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::blockers::BlockerMemory;
use crate::core::gates::Confidence;
use crate::core::ledger::{Artifact, INTERRUPTED_REASON, Task, TaskLedger};
use crate::core::llm::ModelClient;
use crate::core::tools::ToolRegistry;

pub use executor::Executor;
pub use persistence::{Acceptance, ChangePersistence, GitPersistence, NoPersistence};
pub use planner::{PlanError, Planner};
pub use types::{
    LogProgress, Phase, Plan, PlanStatus, PlanStep, ProgressEvent, ProgressSink, StepOutcome,
    StepStatus,
};
pub use verifier::{Verdict, Verifier};

const ARTIFACT_CHARS: usize = 2_000;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("task {0} is not startable")]
    NotStartable(String),
    #[error("task {0} changed state while the pipeline was running")]
    StateChanged(String),
    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// Final word on one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub task: Task,
    pub verified: bool,
    pub reason: String,
    pub commit: Option<String>,
    pub confidence: Option<Confidence>,
}

pub struct Pipeline {
    ledger: Arc<TaskLedger>,
    tools: Arc<ToolRegistry>,
    planner: Planner,
    executor: Executor,
    verifier: Verifier,
    persistence: Arc<dyn ChangePersistence>,
    progress: Arc<dyn ProgressSink>,
}

fn clip(text: &str) -> String {
    text.chars().take(ARTIFACT_CHARS).collect()
}

impl Pipeline {
    pub fn new(
        ledger: Arc<TaskLedger>,
        tools: Arc<ToolRegistry>,
        memory: Arc<BlockerMemory>,
        model: Arc<dyn ModelClient>,
        persistence: Arc<dyn ChangePersistence>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            executor: Executor::new(tools.clone(), memory, ledger.clone(), progress.clone()),
            planner: Planner::new(model.clone()),
            verifier: Verifier::new(model),
            ledger,
            tools,
            persistence,
            progress,
        }
    }

    pub fn ledger(&self) -> &Arc<TaskLedger> {
        &self.ledger
    }

    async fn save(&self, task_id: &str, plan: &Plan) -> Result<()> {
        if self.ledger.checkpoint(task_id, plan.to_checkpoint()?).await?.is_none() {
            return Err(PipelineError::StateChanged(task_id.to_string()).into());
        }
        Ok(())
    }

    async fn emit(&self, task_id: &str, phase: Phase, action: impl Into<String>) {
        types::report(self.progress.as_ref(), ProgressEvent::phase(task_id, phase, action)).await;
    }

    /// Run one task end to end. Fails fast when the task cannot be started.
    pub async fn run(&self, task_id: &str, cancel: &CancellationToken) -> Result<PipelineReport> {
        let Some(task) = self.ledger.start(task_id).await? else {
            return Err(PipelineError::NotStartable(task_id.to_string()).into());
        };
        info!("Pipeline started for task {} (run #{})", task.id, task.execution_count);

        match self.drive(&task, cancel).await {
            Ok(report) => Ok(report),
            Err(e) => {
                if let Err(revert) = self.persistence.discard(&task).await {
                    warn!("Revert after pipeline error failed: {}", revert);
                }
                let changed = matches!(
                    e.downcast_ref::<PipelineError>(),
                    Some(PipelineError::StateChanged(_))
                );
                if !changed {
                    self.ledger.fail(&task.id, &e.to_string()).await?;
                }
                Err(e)
            }
        }
    }

    async fn drive(&self, task: &Task, cancel: &CancellationToken) -> Result<PipelineReport> {
        self.persistence.prepare().await?;

        let mut plan = match Plan::from_checkpoint(&task.checkpoint_data) {
            Some(mut plan) => {
                plan.reset_unfinished();
                info!(
                    "Resuming checkpointed plan for task {} ({} of {} step(s) done)",
                    task.id,
                    plan.count(StepStatus::Done),
                    plan.steps.len()
                );
                plan
            }
            None => {
                self.emit(&task.id, Phase::Planning, "planning").await;
                self.planner
                    .plan(task, &self.tools)
                    .await
                    .map_err(PipelineError::from)?
            }
        };
        self.save(&task.id, &plan).await?;

        plan.status = PlanStatus::Executing;
        self.save(&task.id, &plan).await?;
        self.executor.execute_steps(&task.id, &mut plan, cancel).await?;

        plan.status = PlanStatus::Verifying;
        self.save(&task.id, &plan).await?;

        if cancel.is_cancelled() {
            // Not judged; left for the operator like any interrupted task.
            plan.status = PlanStatus::Failed;
            self.save(&task.id, &plan).await?;
            self.persistence.discard(task).await?;
            let task = self
                .ledger
                .block(&task.id, INTERRUPTED_REASON)
                .await?
                .ok_or_else(|| PipelineError::StateChanged(task.id.clone()))?;
            return Ok(PipelineReport {
                task,
                verified: false,
                reason: INTERRUPTED_REASON.to_string(),
                commit: None,
                confidence: None,
            });
        }

        self.emit(&task.id, Phase::Verifying, "verifying").await;
        let verdict = self.verifier.verify(&plan).await;

        if !verdict.verified {
            return self.reject(task, &mut plan, verdict.reason).await;
        }

        self.emit(&task.id, Phase::Persisting, "persisting changes").await;
        match self.persistence.accept(task).await? {
            Acceptance::Vetoed { reason } => self.reject(task, &mut plan, reason).await,
            Acceptance::Kept { commit, confidence } => {
                plan.status = PlanStatus::Verified;
                self.save(&task.id, &plan).await?;

                let mut artifacts: Vec<Artifact> = plan
                    .steps
                    .iter()
                    .filter_map(|s| {
                        s.output
                            .as_deref()
                            .filter(|o| !o.trim().is_empty())
                            .map(|o| Artifact::new("step_output", &s.name, clip(o)))
                    })
                    .collect();
                artifacts.push(Artifact::new("verification", "verdict", verdict.reason.clone()));
                if let Some(sha) = &commit {
                    artifacts.push(Artifact::new("commit", "git", sha.clone()));
                }

                let task = self
                    .ledger
                    .complete(&task.id, artifacts)
                    .await?
                    .ok_or_else(|| PipelineError::StateChanged(task.id.clone()))?;
                info!("Task {} done: {}", task.id, verdict.reason);
                Ok(PipelineReport {
                    task,
                    verified: true,
                    reason: verdict.reason,
                    commit,
                    confidence,
                })
            }
        }
    }

    /// Revert, then park the task: blocked when a step is waiting on a
    /// secret or permission, failed otherwise.
    async fn reject(&self, task: &Task, plan: &mut Plan, reason: String) -> Result<PipelineReport> {
        plan.status = PlanStatus::Failed;
        self.save(&task.id, plan).await?;
        self.persistence.discard(task).await?;

        let updated = if plan.needs_operator() {
            self.ledger.block(&task.id, &reason).await?
        } else {
            self.ledger.fail(&task.id, &reason).await?
        };
        let task = updated.ok_or_else(|| PipelineError::StateChanged(task.id.clone()))?;
        warn!("Task {} not accepted: {}", task.id, reason);
        Ok(PipelineReport {
            task,
            verified: false,
            reason,
            commit: None,
            confidence: None,
        })
    }
}

#[cfg(test)]
mod tests;
