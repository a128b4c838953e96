//! What the heartbeat does: check the budget, pick the next queued task,
//! run it, tell the operator.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::budget::BudgetTracker;
use crate::core::chat::{ChatPort, error_report};
use crate::core::ledger::{TaskLedger, TaskStatus};
use crate::core::pipeline::Pipeline;
use crate::core::scheduler::HeartbeatTask;

pub struct HeartbeatWorker {
    ledger: Arc<TaskLedger>,
    budget: Arc<BudgetTracker>,
    pipeline: Arc<Pipeline>,
    chat: Arc<dyn ChatPort>,
    cancel: CancellationToken,
    halted: AtomicBool,
}

impl HeartbeatWorker {
    pub fn new(
        pipeline: Arc<Pipeline>,
        budget: Arc<BudgetTracker>,
        chat: Arc<dyn ChatPort>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ledger: pipeline.ledger().clone(),
            budget,
            pipeline,
            chat,
            cancel,
            halted: AtomicBool::new(false),
        }
    }

    async fn notify(&self, text: &str) {
        if let Err(e) = self.chat.send(text).await {
            warn!("Chat notification failed: {}", e);
        }
    }

    /// False when a cap is reached. The operator hears about it once per
    /// exhaustion, not on every tick.
    async fn budget_allows(&self) -> Result<bool> {
        for alert in self.budget.check_threshold_alerts().await? {
            self.notify(&format!(
                "⚠️ Budget {}% used (${:.2} of ${:.2})",
                alert.percent, alert.spent_usd, alert.cap_usd
            ))
            .await;
        }

        if self.budget.can_proceed().await? {
            self.halted.store(false, Ordering::SeqCst);
            return Ok(true);
        }
        if !self.halted.swap(true, Ordering::SeqCst) {
            let summary = self.budget.summary().await?;
            warn!("Budget exhausted, no new work will be picked");
            self.notify(&format!(
                "⏸ Budget exhausted: session ${:.2} of ${:.2}. Pausing work until the budget allows more.",
                summary.session_spent, summary.session_cap
            ))
            .await;
        }
        Ok(false)
    }
}

#[async_trait]
impl HeartbeatTask for HeartbeatWorker {
    async fn run(&self) -> Result<()> {
        if !self.budget_allows().await? {
            return Ok(());
        }
        let Some(task) = self.ledger.next_queued().await? else {
            debug!("Heartbeat: backlog empty");
            return Ok(());
        };
        info!("Heartbeat picked task {} ({})", task.id, task.title);
        self.notify(&format!("🌙 Starting: {} ({})", task.title, task.id)).await;

        match self.pipeline.run(&task.id, &self.cancel).await {
            Ok(report) if report.verified => {
                let mut text = format!("✅ Done: {}\n{}", report.task.title, report.reason);
                if let Some(sha) = &report.commit {
                    text.push_str(&format!("\ncommit {}", sha));
                }
                self.notify(&text).await;
                Ok(())
            }
            Ok(report) => {
                let what = if report.task.status == TaskStatus::Blocked {
                    "Task blocked"
                } else {
                    "Task failed"
                };
                self.notify(&error_report(what, Some(&report.task.id), &report.reason))
                    .await;
                Ok(())
            }
            Err(e) => {
                self.notify(&error_report("Task failed", Some(&task.id), &format!("{:#}", e)))
                    .await;
                Err(e)
            }
        }
    }
}
