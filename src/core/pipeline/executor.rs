//! Runs plan steps in order, recovering from failures with remembered
//! fixes and generic fallbacks.

use anyhow::Result;
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::PipelineError;
use super::types::{Phase, Plan, ProgressEvent, ProgressSink, StepOutcome, StepStatus, report};
use crate::core::blockers::{BlockerMemory, BlockerType, ResolutionAttempt, classify};
use crate::core::ledger::TaskLedger;
use crate::core::tools::{ToolRegistry, fallback_for};

pub const MAX_STEP_RETRIES: u32 = 2;

enum Source {
    Memory,
    Fallback,
}

pub struct Executor {
    tools: Arc<ToolRegistry>,
    memory: Arc<BlockerMemory>,
    ledger: Arc<TaskLedger>,
    progress: Arc<dyn ProgressSink>,
}

impl Executor {
    pub fn new(
        tools: Arc<ToolRegistry>,
        memory: Arc<BlockerMemory>,
        ledger: Arc<TaskLedger>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            tools,
            memory,
            ledger,
            progress,
        }
    }

    fn event(&self, task_id: &str, plan: &Plan, index: usize, action: String) -> ProgressEvent {
        let mut event = ProgressEvent::phase(task_id, Phase::Executing, action);
        event.step_index = Some(index);
        event.step_name = Some(plan.steps[index].name.clone());
        event.next_step = plan.steps.get(index + 1).map(|s| s.name.clone());
        event.blockers = plan.steps.iter().filter_map(|s| s.blocker_type).collect();
        event
    }

    async fn checkpoint(&self, task_id: &str, plan: &Plan) -> Result<()> {
        if self.ledger.checkpoint(task_id, plan.to_checkpoint()?).await?.is_none() {
            return Err(PipelineError::StateChanged(task_id.to_string()).into());
        }
        Ok(())
    }

    /// Next tool to try for a failure, never one already attempted on this
    /// step and never one that is not registered.
    async fn resolve(
        &self,
        original_tool: &str,
        original_error: &str,
        tried: &[String],
    ) -> Result<Option<(String, Option<Map<String, Value>>, Source)>> {
        let usable = |tool: &str| self.tools.has(tool) && !tried.iter().any(|t| t == tool);

        if let Some(known) = self.memory.lookup(original_tool, original_error).await?
            && usable(&known.resolution_tool)
        {
            let args = (!known.resolution_args.is_empty()).then_some(known.resolution_args);
            return Ok(Some((known.resolution_tool, args, Source::Memory)));
        }
        if let Some(fallback) = fallback_for(original_tool)
            && usable(fallback)
        {
            return Ok(Some((fallback.to_string(), None, Source::Fallback)));
        }
        Ok(None)
    }

    pub async fn execute_steps(
        &self,
        task_id: &str,
        plan: &mut Plan,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for index in 0..plan.steps.len() {
            if plan.steps[index].status == StepStatus::Done {
                continue;
            }
            if cancel.is_cancelled() {
                for step in plan.steps[index..].iter_mut() {
                    step.status = StepStatus::Skipped;
                }
                info!("Task {} cancelled; {} step(s) skipped", task_id, plan.steps.len() - index);
                self.checkpoint(task_id, plan).await?;
                break;
            }

            self.run_step(task_id, plan, index).await?;
            self.checkpoint(task_id, plan).await?;
        }
        Ok(())
    }

    async fn run_step(&self, task_id: &str, plan: &mut Plan, index: usize) -> Result<()> {
        {
            let step = &mut plan.steps[index];
            step.status = StepStatus::Running;
            step.started_at = Some(Utc::now());
        }
        let action = format!("running {}", plan.steps[index].tool);
        report(self.progress.as_ref(), self.event(task_id, plan, index, action)).await;

        let mut tried = vec![plan.steps[index].tool.clone()];
        let mut original: Option<(String, String)> = None;
        let mut source: Option<Source> = None;

        loop {
            let (tool, args) = {
                let step = &plan.steps[index];
                (step.tool.clone(), step.args.clone())
            };
            let result = self.tools.execute(&tool, &args).await;

            if result.success {
                let step = &mut plan.steps[index];
                step.status = StepStatus::Done;
                step.output = Some(result.output);
                step.error = None;
                step.completed_at = Some(Utc::now());
                step.outcome = Some(match source {
                    None => StepOutcome::Done,
                    Some(Source::Memory) => StepOutcome::Retry,
                    Some(Source::Fallback) => StepOutcome::Fallback,
                });
                if let Some((original_tool, original_error)) = &original {
                    self.memory
                        .record(&ResolutionAttempt {
                            original_tool: original_tool.clone(),
                            original_error: original_error.clone(),
                            resolution_tool: tool.clone(),
                            resolution_args: args,
                            task_id: Some(task_id.to_string()),
                        })
                        .await?;
                }
                let done = format!("{} succeeded in {}ms", tool, result.duration_ms);
                report(self.progress.as_ref(), self.event(task_id, plan, index, done)).await;
                return Ok(());
            }

            let error = result.error.unwrap_or_else(|| "tool failed without an error".to_string());
            let blocker = classify(&error);
            warn!(
                "Step '{}' failed with {} [{}]: {}",
                plan.steps[index].name,
                tool,
                blocker.as_str(),
                error
            );
            plan.steps[index].blocker_type = Some(blocker);
            plan.steps[index].error = Some(error.clone());

            let (original_tool, original_error) = match &original {
                Some((t, e)) => {
                    // A substitute failed: remember it against the original symptom.
                    self.memory
                        .record_failure(&ResolutionAttempt {
                            original_tool: t.clone(),
                            original_error: e.clone(),
                            resolution_tool: tool.clone(),
                            resolution_args: args,
                            task_id: Some(task_id.to_string()),
                        })
                        .await?;
                    (t.clone(), e.clone())
                }
                None => {
                    plan.steps[index].original_tool = Some(tool.clone());
                    plan.steps[index].original_args = Some(args);
                    original = Some((tool.clone(), error.clone()));
                    (tool.clone(), error.clone())
                }
            };

            let next = if plan.steps[index].retry_count < MAX_STEP_RETRIES {
                self.resolve(&original_tool, &original_error, &tried).await?
            } else {
                None
            };

            match next {
                Some((substitute, new_args, how)) => {
                    let step = &mut plan.steps[index];
                    step.retry_count += 1;
                    step.tool = substitute.clone();
                    if let Some(a) = new_args {
                        step.args = a;
                    }
                    tried.push(substitute.clone());
                    let action = match how {
                        Source::Memory => format!("retrying with remembered fix {}", substitute),
                        Source::Fallback => format!("falling back to {}", substitute),
                    };
                    source = Some(how);
                    report(self.progress.as_ref(), self.event(task_id, plan, index, action)).await;
                }
                None => {
                    if tool == original_tool {
                        // Nothing was tried in its place; record the dead end.
                        self.memory
                            .record_failure(&ResolutionAttempt {
                                original_tool: original_tool.clone(),
                                original_error: original_error.clone(),
                                resolution_tool: tool.clone(),
                                resolution_args: Map::new(),
                                task_id: Some(task_id.to_string()),
                            })
                            .await?;
                    }
                    let step = &mut plan.steps[index];
                    step.status = StepStatus::Failed;
                    step.outcome = Some(StepOutcome::Blocked);
                    step.completed_at = Some(Utc::now());
                    let blocked = format!("blocked ({})", blocker_label(step.blocker_type));
                    report(self.progress.as_ref(), self.event(task_id, plan, index, blocked)).await;
                    return Ok(());
                }
            }
        }
    }
}

fn blocker_label(blocker: Option<BlockerType>) -> &'static str {
    blocker.map(BlockerType::as_str).unwrap_or("unknown")
}
