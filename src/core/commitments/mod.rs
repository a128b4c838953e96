//! Commitment engine: promises the agent makes in its own replies, detected,
//! stored, and carried out on schedule.

pub mod clock;
pub mod detector;
pub mod scheduler;
pub mod store;
pub mod types;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::core::budget::{BudgetExhausted, BudgetTracker};
use crate::core::ledger::{NewTask, TaskType};
use crate::core::pipeline::Pipeline;

pub use clock::{CronClock, ScheduleClock};
pub use detector::detect;
pub use scheduler::{CommitmentScheduler, DEFAULT_POLL_INTERVAL, RunOutcome};
pub use store::CommitmentStore;
pub use types::{
    Commitment, CommitmentKind, CommitmentStatus, CommitmentType, ExecuteAt, NewCommitment,
};

/// Commitment work outranks ordinary backlog.
const COMMITMENT_PRIORITY: i64 = 10;

/// Carries out one commitment run. `Ok` holds a short summary for the
/// operator.
#[async_trait]
pub trait CommitmentExecutor: Send + Sync {
    async fn execute(&self, commitment: &Commitment) -> Result<String>;
}

/// Turns each run into a ledger task and drives it through the pipeline.
/// Runs are refused while the budget is exhausted.
pub struct PipelineCommitmentExecutor {
    pipeline: Arc<Pipeline>,
    budget: Arc<BudgetTracker>,
    cancel: CancellationToken,
}

impl PipelineCommitmentExecutor {
    pub fn new(pipeline: Arc<Pipeline>, budget: Arc<BudgetTracker>, cancel: CancellationToken) -> Self {
        Self {
            pipeline,
            budget,
            cancel,
        }
    }
}

#[async_trait]
impl CommitmentExecutor for PipelineCommitmentExecutor {
    async fn execute(&self, commitment: &Commitment) -> Result<String> {
        if !self.budget.can_proceed().await? {
            return Err(BudgetExhausted.into());
        }
        let task = self
            .pipeline
            .ledger()
            .create(
                NewTask::new(commitment.action_description.clone(), TaskType::Commitment)
                    .priority(COMMITMENT_PRIORITY),
            )
            .await?;
        let report = self.pipeline.run(&task.id, &self.cancel).await?;
        if report.verified {
            Ok(report.reason)
        } else {
            Err(anyhow!("task {}: {}", task.id, report.reason))
        }
    }
}
