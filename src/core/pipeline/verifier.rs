use std::sync::Arc;
use tracing::{info, warn};

use super::types::{Plan, StepStatus};
use crate::core::budget::Tier;
use crate::core::llm::{ChatMessage, ModelClient, extract_json_block};

const EVIDENCE_CHARS: usize = 2_000;

const VERIFIER_SYSTEM: &str = "You verify the work of an unattended agent. Judge strictly: \
if the evidence does not clearly satisfy the criteria, it is not verified. \
Reply with JSON only: {\"verified\": true|false, \"reason\": \"...\"}";

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub verified: bool,
    pub reason: String,
}

#[derive(serde::Deserialize)]
struct RawVerdict {
    verified: Option<bool>,
    #[serde(default)]
    reason: String,
}

fn clip(text: &str) -> String {
    text.chars().take(EVIDENCE_CHARS).collect()
}

/// Verdict from step statuses alone.
fn step_verdict(plan: &Plan) -> Option<Verdict> {
    let total = plan.steps.len();
    let done = plan.count(StepStatus::Done);
    if done == total {
        return None;
    }
    if done == 0 {
        let first_error = plan
            .steps
            .iter()
            .find_map(|s| s.error.as_deref())
            .unwrap_or("no step ran");
        return Some(Verdict {
            verified: false,
            reason: format!("all {} step(s) failed: {}", total, first_error),
        });
    }

    let mut parts = vec![format!("partial completion: {} of {} step(s) succeeded", done, total)];
    for step in plan.steps.iter().filter(|s| s.status != StepStatus::Done) {
        parts.push(match step.status {
            StepStatus::Skipped => format!("skipped '{}'", step.name),
            _ => format!(
                "'{}' failed: {}",
                step.name,
                step.error.as_deref().unwrap_or("unknown error")
            ),
        });
    }
    Some(Verdict {
        verified: false,
        reason: parts.join("; "),
    })
}

fn parse_verdict(text: &str) -> Verdict {
    let parsed = extract_json_block(text).and_then(|json| serde_json::from_str::<RawVerdict>(json).ok());
    match parsed {
        Some(RawVerdict {
            verified: Some(verified),
            reason,
        }) => Verdict {
            verified,
            reason: if reason.is_empty() {
                "no reason given".to_string()
            } else {
                reason
            },
        },
        _ => Verdict {
            verified: false,
            reason: "verifier reply was not a verdict".to_string(),
        },
    }
}

pub struct Verifier {
    model: Arc<dyn ModelClient>,
}

impl Verifier {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self { model }
    }

    pub async fn verify(&self, plan: &Plan) -> Verdict {
        if let Some(verdict) = step_verdict(plan) {
            info!("Verification decided without model: {}", verdict.reason);
            return verdict;
        }

        let mut evidence = format!(
            "## Goal\n{}\n\n## Overall success criteria\n{}\n\n## Steps\n",
            plan.goal, plan.overall_criteria
        );
        for (i, step) in plan.steps.iter().enumerate() {
            evidence.push_str(&format!(
                "### {}. {} ({})\nCriteria: {}\nOutput:\n{}\n\n",
                i + 1,
                step.name,
                step.tool,
                step.success_criteria,
                clip(step.output.as_deref().unwrap_or(""))
            ));
        }

        match self
            .model
            .complete(Tier::Review, VERIFIER_SYSTEM, &[ChatMessage::user(evidence)])
            .await
        {
            Ok(completion) => parse_verdict(&completion.text),
            Err(e) => {
                // Every step succeeded; fall back to that evidence.
                warn!("Verifier model call failed, using step verdict: {}", e);
                Verdict {
                    verified: true,
                    reason: format!(
                        "all {} step(s) succeeded (model verification unavailable: {})",
                        plan.steps.len(),
                        e
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::types::{PlanStatus, PlanStep};
    use crate::core::testing::ScriptedModel;
    use serde_json::Map;

    fn plan(statuses: &[StepStatus]) -> Plan {
        Plan {
            goal: "g".to_string(),
            steps: statuses
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    let mut step = PlanStep::new(&format!("s{}", i), "shell", Map::new(), "ok");
                    step.status = *s;
                    if *s == StepStatus::Failed {
                        step.error = Some("HTTP 403".to_string());
                    } else {
                        step.output = Some("fine".to_string());
                    }
                    step
                })
                .collect(),
            overall_criteria: "all fine".to_string(),
            status: PlanStatus::Verifying,
        }
    }

    #[tokio::test]
    async fn all_failed_never_calls_model() {
        let model = Arc::new(ScriptedModel::new(vec![r#"{"verified": true}"#]));
        let verifier = Verifier::new(model.clone());
        let verdict = verifier
            .verify(&plan(&[StepStatus::Failed, StepStatus::Failed]))
            .await;
        assert!(!verdict.verified);
        assert!(verdict.reason.contains("all 2 step(s) failed"));
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn partial_completion_is_deterministic() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let verifier = Verifier::new(model.clone());
        let verdict = verifier
            .verify(&plan(&[StepStatus::Done, StepStatus::Failed, StepStatus::Skipped]))
            .await;
        assert!(!verdict.verified);
        assert!(verdict.reason.starts_with("partial completion: 1 of 3"));
        assert!(verdict.reason.contains("skipped 's2'"));
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn model_judges_full_success() {
        let model = Arc::new(ScriptedModel::new(vec![
            r#"{"verified": true, "reason": "output matches"}"#,
        ]));
        let verifier = Verifier::new(model.clone());
        let verdict = verifier.verify(&plan(&[StepStatus::Done])).await;
        assert_eq!(
            verdict,
            Verdict {
                verified: true,
                reason: "output matches".to_string()
            }
        );
        assert_eq!(model.tiers(), vec![Tier::Review]);
    }

    #[tokio::test]
    async fn ambiguous_reply_is_not_verified() {
        let model = Arc::new(ScriptedModel::new(vec!["Looks good to me!"]));
        let verdict = Verifier::new(model).verify(&plan(&[StepStatus::Done])).await;
        assert!(!verdict.verified);
    }

    #[tokio::test]
    async fn model_error_falls_back_to_step_evidence() {
        let model = Arc::new(ScriptedModel::with_results(vec![Err("503".to_string())]));
        let verdict = Verifier::new(model).verify(&plan(&[StepStatus::Done])).await;
        assert!(verdict.verified);
        assert!(verdict.reason.contains("unavailable"));
    }
}
