use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::gates::{Confidence, GateRunner};
use crate::core::ledger::Task;
use crate::core::workspace::Workspace;

#[derive(Debug, Clone, PartialEq)]
pub enum Acceptance {
    Kept {
        commit: Option<String>,
        confidence: Option<Confidence>,
    },
    Vetoed {
        reason: String,
    },
}

/// What happens to workspace changes once a task is judged.
#[async_trait]
pub trait ChangePersistence: Send + Sync {
    /// Called once before a task starts executing.
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }
    async fn accept(&self, task: &Task) -> Result<Acceptance>;
    async fn discard(&self, task: &Task) -> Result<()>;
}

/// For deployments without a repository: nothing to commit or revert.
pub struct NoPersistence;

#[async_trait]
impl ChangePersistence for NoPersistence {
    async fn accept(&self, _task: &Task) -> Result<Acceptance> {
        Ok(Acceptance::Kept {
            commit: None,
            confidence: None,
        })
    }

    async fn discard(&self, _task: &Task) -> Result<()> {
        Ok(())
    }
}

/// Runs gates, then commits on the work branch. Reverting is `discard`'s job.
pub struct GitPersistence {
    workspace: Arc<dyn Workspace>,
    gates: GateRunner,
    branch: String,
}

impl GitPersistence {
    pub fn new(workspace: Arc<dyn Workspace>, gates: GateRunner, branch: String) -> Self {
        Self {
            workspace,
            gates,
            branch,
        }
    }
}

#[async_trait]
impl ChangePersistence for GitPersistence {
    async fn prepare(&self) -> Result<()> {
        self.workspace.ensure_branch(&self.branch).await
    }

    async fn accept(&self, task: &Task) -> Result<Acceptance> {
        let report = self.gates.evaluate(self.workspace.root()).await?;
        if report.confidence == Confidence::Failed {
            let reason = report
                .failure_reason()
                .unwrap_or_else(|| "verification gates failed".to_string());
            // The pipeline discards vetoed changes.
            warn!("Gates vetoed task {}: {}", task.id, reason);
            return Ok(Acceptance::Vetoed { reason });
        }
        let message = format!(
            "nightshift: {} [{}]\n\ntask: {}",
            task.title,
            report.confidence.as_str(),
            task.id
        );
        let commit = self.workspace.commit(&message).await?;
        info!(
            "Accepted task {} ({} confidence, commit {})",
            task.id,
            report.confidence.as_str(),
            commit.as_deref().unwrap_or("none")
        );
        Ok(Acceptance::Kept {
            commit,
            confidence: Some(report.confidence),
        })
    }

    async fn discard(&self, task: &Task) -> Result<()> {
        info!("Discarding workspace changes for task {}", task.id);
        self.workspace.revert_all().await
    }
}
