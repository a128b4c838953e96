use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use super::types::{Plan, PlanStatus, PlanStep};
use crate::core::budget::Tier;
use crate::core::ledger::Task;
use crate::core::llm::{ChatMessage, ModelClient, extract_json_block};
use crate::core::tools::ToolRegistry;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("planner call failed: {0}")]
    Model(String),
    #[error("planner returned no JSON plan")]
    NoJson,
    #[error("planner returned malformed JSON: {0}")]
    Malformed(String),
    #[error("planner returned a plan with no steps")]
    NoSteps,
    #[error("step {step} uses unknown tool '{tool}'")]
    UnknownTool { step: usize, tool: String },
    #[error("step {step} args must be a JSON object")]
    BadArgs { step: usize },
}

#[derive(serde::Deserialize)]
struct RawPlan {
    #[serde(default)]
    goal: String,
    #[serde(default)]
    steps: Vec<RawStep>,
    #[serde(default)]
    overall_criteria: String,
}

#[derive(serde::Deserialize)]
struct RawStep {
    #[serde(default)]
    name: String,
    tool: String,
    #[serde(default)]
    args: Option<Value>,
    #[serde(default)]
    success_criteria: String,
}

const PLANNER_SYSTEM: &str = "You plan work for an unattended agent. \
Produce the plan with the fewest steps that achieves the goal. Each step uses exactly one tool \
from the catalog and states success criteria a machine can check from the tool output.

Reply with JSON only:
{\"goal\": \"...\", \"overall_criteria\": \"...\", \"steps\": [
  {\"name\": \"...\", \"tool\": \"<tool name>\", \"args\": {...}, \"success_criteria\": \"...\"}
]}";

/// Parse and validate planner output. No partial plans: any defect rejects
/// the whole reply.
pub fn parse_plan(text: &str, tools: &ToolRegistry, fallback_goal: &str) -> Result<Plan, PlanError> {
    let json = extract_json_block(text).ok_or(PlanError::NoJson)?;
    let raw: RawPlan = serde_json::from_str(json).map_err(|e| PlanError::Malformed(e.to_string()))?;
    if raw.steps.is_empty() {
        return Err(PlanError::NoSteps);
    }

    let mut steps = Vec::with_capacity(raw.steps.len());
    for (i, raw_step) in raw.steps.into_iter().enumerate() {
        let index = i + 1;
        if !tools.has(&raw_step.tool) {
            return Err(PlanError::UnknownTool {
                step: index,
                tool: raw_step.tool,
            });
        }
        let args = match raw_step.args {
            None | Some(Value::Null) => serde_json::Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => return Err(PlanError::BadArgs { step: index }),
        };
        let name = if raw_step.name.trim().is_empty() {
            format!("step {}", index)
        } else {
            raw_step.name
        };
        steps.push(PlanStep::new(&name, &raw_step.tool, args, &raw_step.success_criteria));
    }

    Ok(Plan {
        goal: if raw.goal.trim().is_empty() {
            fallback_goal.to_string()
        } else {
            raw.goal
        },
        steps,
        overall_criteria: raw.overall_criteria,
        status: PlanStatus::Planned,
    })
}

pub struct Planner {
    model: Arc<dyn ModelClient>,
}

impl Planner {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self { model }
    }

    pub async fn plan(&self, task: &Task, tools: &ToolRegistry) -> Result<Plan, PlanError> {
        let mut prompt = format!(
            "## Task ({})\n{}\n",
            task.task_type.as_str(),
            task.title
        );
        if let Some(deadline) = task.deadline {
            prompt.push_str(&format!("Deadline: {}\n", deadline.to_rfc3339()));
        }
        prompt.push_str("\n## Tool catalog\n");
        prompt.push_str(&tools.catalog());

        let completion = self
            .model
            .complete(Tier::Planning, PLANNER_SYSTEM, &[ChatMessage::user(prompt)])
            .await
            .map_err(|e| PlanError::Model(e.to_string()))?;
        let plan = parse_plan(&completion.text, tools, &task.title)?;
        info!("Planned {} step(s) for task {}", plan.steps.len(), task.id);
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::ScriptedTool;
    use std::time::Duration;

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new(Duration::from_secs(30));
        reg.register(Arc::new(ScriptedTool::ok("web_fetch", "<html>")));
        reg.register(Arc::new(ScriptedTool::ok("shell", "")));
        reg
    }

    #[test]
    fn parses_fenced_plan() {
        let text = r#"Sure.
```json
{"goal": "read the news", "overall_criteria": "headline captured",
 "steps": [{"name": "fetch", "tool": "web_fetch", "args": {"url": "https://n.io"}, "success_criteria": "non-empty body"}]}
```"#;
        let plan = parse_plan(text, &registry(), "fallback").unwrap();
        assert_eq!(plan.goal, "read the news");
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].args["url"], "https://n.io");
        assert_eq!(plan.status, PlanStatus::Planned);
    }

    #[test]
    fn missing_name_and_goal_get_defaults() {
        let plan = parse_plan(r#"{"steps": [{"tool": "shell"}]}"#, &registry(), "the task").unwrap();
        assert_eq!(plan.goal, "the task");
        assert_eq!(plan.steps[0].name, "step 1");
    }

    #[test]
    fn rejects_defective_plans() {
        let reg = registry();
        assert!(matches!(parse_plan("no idea", &reg, ""), Err(PlanError::NoJson)));
        assert!(matches!(parse_plan("{\"steps\": [", &reg, ""), Err(PlanError::Malformed(_))));
        assert!(matches!(parse_plan(r#"{"steps": []}"#, &reg, ""), Err(PlanError::NoSteps)));
        assert!(matches!(
            parse_plan(r#"{"steps": [{"tool": "teleport"}]}"#, &reg, ""),
            Err(PlanError::UnknownTool { step: 1, .. })
        ));
        assert!(matches!(
            parse_plan(r#"{"steps": [{"tool": "shell"}, {"tool": "shell", "args": ["ls"]}]}"#, &reg, ""),
            Err(PlanError::BadArgs { step: 2 })
        ));
    }
}
