use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::core::blockers::BlockerType;

/// Checkpoint key the in-flight plan is stored under.
pub const PLAN_KEY: &str = "plan";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Planned,
    Executing,
    Verifying,
    Verified,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

/// How a finished step got there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Succeeded with the planned tool.
    Done,
    /// Gave up; needs a human or a new plan.
    Blocked,
    /// Succeeded with a generic fallback tool.
    Fallback,
    /// Succeeded by reapplying a remembered fix.
    Retry,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PlanStep {
    pub name: String,
    pub tool: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub success_criteria: String,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outcome: Option<StepOutcome>,
    #[serde(default)]
    pub blocker_type: Option<BlockerType>,
    #[serde(default)]
    pub original_tool: Option<String>,
    /// Planned arguments, kept once a substitute may have replaced them.
    #[serde(default)]
    pub original_args: Option<Map<String, Value>>,
}

impl PlanStep {
    pub fn new(name: &str, tool: &str, args: Map<String, Value>, success_criteria: &str) -> Self {
        Self {
            name: name.to_string(),
            tool: tool.to_string(),
            args,
            success_criteria: success_criteria.to_string(),
            status: StepStatus::Pending,
            output: None,
            error: None,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            outcome: None,
            blocker_type: None,
            original_tool: None,
            original_args: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Plan {
    pub goal: String,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub overall_criteria: String,
    #[serde(default)]
    pub status: PlanStatus,
}

impl Plan {
    /// A plan left mid-flight in a checkpoint bag, if any.
    pub fn from_checkpoint(data: &Map<String, Value>) -> Option<Plan> {
        let plan: Plan = serde_json::from_value(data.get(PLAN_KEY)?.clone()).ok()?;
        matches!(
            plan.status,
            PlanStatus::Planned | PlanStatus::Executing | PlanStatus::Verifying
        )
        .then_some(plan)
    }

    pub fn to_checkpoint(&self) -> Result<Map<String, Value>> {
        let mut data = Map::new();
        data.insert(PLAN_KEY.to_string(), serde_json::to_value(self)?);
        Ok(data)
    }

    /// Prepare a resumed plan: finished steps stay, anything else runs again
    /// as planned, with its planned tool and a fresh retry allowance.
    pub fn reset_unfinished(&mut self) {
        for step in self.steps.iter_mut().filter(|s| s.status != StepStatus::Done) {
            if let Some(tool) = step.original_tool.take() {
                step.tool = tool;
            }
            if let Some(args) = step.original_args.take() {
                step.args = args;
            }
            step.status = StepStatus::Pending;
            step.error = None;
            step.outcome = None;
            step.blocker_type = None;
            step.retry_count = 0;
        }
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// A step gave up on something only the operator can supply.
    pub fn needs_operator(&self) -> bool {
        self.steps.iter().any(|s| {
            s.outcome == Some(StepOutcome::Blocked)
                && matches!(
                    s.blocker_type,
                    Some(BlockerType::MissingSecret | BlockerType::MissingPermission)
                )
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Executing,
    Verifying,
    Persisting,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProgressEvent {
    pub task_id: String,
    pub phase: Phase,
    pub step_index: Option<usize>,
    pub step_name: Option<String>,
    pub action: String,
    pub result: Option<String>,
    pub next_step: Option<String>,
    pub blockers: Vec<BlockerType>,
}

impl ProgressEvent {
    pub fn phase(task_id: &str, phase: Phase, action: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            phase,
            step_index: None,
            step_name: None,
            action: action.into(),
            result: None,
            next_step: None,
            blockers: Vec::new(),
        }
    }
}

#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn emit(&self, event: &ProgressEvent) -> Result<()>;
}

/// Delivers an event; sink failures are logged and otherwise ignored.
pub async fn report(sink: &dyn ProgressSink, event: ProgressEvent) {
    if let Err(e) = sink.emit(&event).await {
        warn!("Progress sink error (ignored): {}", e);
    }
}

/// Writes progress to the log.
pub struct LogProgress;

#[async_trait]
impl ProgressSink for LogProgress {
    async fn emit(&self, event: &ProgressEvent) -> Result<()> {
        match (&event.step_name, &event.result) {
            (Some(step), Some(result)) => {
                info!("[{}] {} :: {} -> {}", event.task_id, step, event.action, result)
            }
            (Some(step), None) => info!("[{}] {} :: {}", event.task_id, step, event.action),
            _ => info!("[{}] {:?}: {}", event.task_id, event.phase, event.action),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Plan {
        Plan {
            goal: "g".to_string(),
            steps: vec![
                PlanStep::new("one", "read_file", Map::new(), "file read"),
                PlanStep::new("two", "shell", Map::new(), "exit 0"),
            ],
            overall_criteria: "both ran".to_string(),
            status: PlanStatus::Executing,
        }
    }

    #[test]
    fn checkpoint_round_trip_reuses_in_flight_plan() {
        let plan = sample();
        let bag = plan.to_checkpoint().unwrap();
        assert_eq!(Plan::from_checkpoint(&bag), Some(plan));
    }

    #[test]
    fn finished_plans_are_not_reused() {
        let mut plan = sample();
        plan.status = PlanStatus::Failed;
        assert!(Plan::from_checkpoint(&plan.to_checkpoint().unwrap()).is_none());
        assert!(Plan::from_checkpoint(&Map::new()).is_none());
    }

    #[test]
    fn step_defaults_fill_missing_fields() {
        let step: PlanStep =
            serde_json::from_value(json!({"name": "n", "tool": "shell"})).unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.retry_count, 0);
        assert!(step.args.is_empty());
    }

    #[test]
    fn reset_restores_the_planned_tool() {
        let mut plan = sample();
        let planned = plan.steps[1].args.clone();
        let step = &mut plan.steps[1];
        step.status = StepStatus::Failed;
        step.outcome = Some(StepOutcome::Blocked);
        step.original_tool = Some("shell".to_string());
        step.original_args = Some(planned.clone());
        step.tool = "browser_fetch".to_string();
        step.args.insert("input".to_string(), json!("https://fallback.example"));
        step.retry_count = 2;
        step.blocker_type = Some(BlockerType::AccessDenied);

        plan.reset_unfinished();
        let step = &plan.steps[1];
        assert_eq!(step.tool, "shell");
        assert_eq!(step.args, planned);
        assert_eq!(step.retry_count, 0);
        assert!(step.original_tool.is_none());
        assert!(step.blocker_type.is_none());
        assert_eq!(step.status, StepStatus::Pending);
    }

    #[test]
    fn reset_keeps_done_steps() {
        let mut plan = sample();
        plan.steps[0].status = StepStatus::Done;
        plan.steps[1].status = StepStatus::Running;
        plan.reset_unfinished();
        assert_eq!(plan.steps[0].status, StepStatus::Done);
        assert_eq!(plan.steps[1].status, StepStatus::Pending);
    }
}
