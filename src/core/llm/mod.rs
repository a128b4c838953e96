pub mod backend;
pub mod task_executor;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::core::budget::{BudgetExhausted, BudgetTracker, Tier, Usage};

pub use backend::{BackendClient, ModelBackend};
pub use task_executor::ModelTaskExecutor;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A finished model call with its metering data.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
    pub provider: String,
}

/// Plain chat completion used for planning, verification and conversation.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        tier: Tier,
        system: &str,
        messages: &[ChatMessage],
    ) -> Result<Completion>;
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FileChange {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub changes: Vec<FileChange>,
    pub summary: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
}

/// File-mutating work: the model proposes whole-file changes which the
/// executor applies to the workspace.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute_task(&self, system: &str, task: &str) -> Result<TaskOutcome>;
}

/// Wraps a backend so every call is priced and recorded, and refuses calls
/// once a cap is reached.
pub struct MeteredModel {
    inner: Arc<dyn ModelClient>,
    budget: Arc<BudgetTracker>,
}

impl MeteredModel {
    pub fn new(inner: Arc<dyn ModelClient>, budget: Arc<BudgetTracker>) -> Self {
        Self { inner, budget }
    }
}

#[async_trait]
impl ModelClient for MeteredModel {
    async fn complete(
        &self,
        tier: Tier,
        system: &str,
        messages: &[ChatMessage],
    ) -> Result<Completion> {
        if !self.budget.can_proceed().await? {
            return Err(BudgetExhausted.into());
        }
        let completion = self.inner.complete(tier, system, messages).await?;
        let record = self
            .budget
            .record_usage(Usage {
                tier,
                provider: completion.provider.clone(),
                model: completion.model.clone(),
                input_tokens: completion.input_tokens,
                output_tokens: completion.output_tokens,
            })
            .await?;
        debug!(
            "[{}] {} in / {} out tokens on {} (${:.4})",
            tier.as_str(),
            record.input_tokens,
            record.output_tokens,
            record.model,
            record.cost_usd
        );
        Ok(completion)
    }
}

/// Extract a JSON block from model output. Tries a fenced ```json block,
/// then any fenced block, then the outermost `{...}` / `[...]` span.
pub(crate) fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    for fence in ["```json", "```"] {
        if let Some(start) = trimmed.find(fence) {
            let content_start = start + fence.len();
            if let Some(end) = trimmed[content_start..].find("```") {
                let block = trimmed[content_start..content_start + end].trim();
                if block.starts_with('{') || block.starts_with('[') {
                    return Some(block);
                }
            }
        }
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Some(trimmed);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_datastore;
    use crate::core::budget::BudgetSettings;

    struct Fixed;

    #[async_trait]
    impl ModelClient for Fixed {
        async fn complete(&self, _: Tier, _: &str, _: &[ChatMessage]) -> Result<Completion> {
            Ok(Completion {
                text: "ok".to_string(),
                input_tokens: 1_000_000,
                output_tokens: 0,
                model: "claude-sonnet-4-20250514".to_string(),
                provider: "anthropic".to_string(),
            })
        }
    }

    #[test]
    fn extract_json_block_fenced() {
        let text = "Preamble\n```json\n{\"key\": \"value\"}\n```\nPostamble";
        assert_eq!(extract_json_block(text), Some("{\"key\": \"value\"}"));
    }

    #[test]
    fn extract_json_block_bare_fence_and_raw() {
        assert_eq!(extract_json_block("```\n[1, 2]\n```"), Some("[1, 2]"));
        assert_eq!(extract_json_block("{\"steps\": []}"), Some("{\"steps\": []}"));
    }

    #[test]
    fn extract_json_block_embedded_object() {
        let text = "Here you go: {\"verified\": true} hope that helps";
        assert_eq!(extract_json_block(text), Some("{\"verified\": true}"));
    }

    #[test]
    fn extract_json_block_none_for_text() {
        assert!(extract_json_block("Hello world").is_none());
        assert!(extract_json_block("").is_none());
    }

    #[tokio::test]
    async fn metered_model_records_every_call() {
        let store = test_datastore();
        let budget = Arc::new(
            BudgetTracker::new(
                store.get_db(),
                BudgetSettings {
                    project: "p".to_string(),
                    session_cap_usd: 10.0,
                    global_cap_usd: None,
                    alert_thresholds: vec![],
                },
            )
            .await
            .unwrap(),
        );
        let model = MeteredModel::new(Arc::new(Fixed), budget.clone());
        model
            .complete(Tier::Planning, "sys", &[ChatMessage::user("hi")])
            .await
            .unwrap();
        assert!((budget.session_total().await.unwrap() - 3.0).abs() < 1e-9);
        let by_tier = budget.totals_by_tier().await.unwrap();
        assert_eq!(by_tier[0].0, "planning");
    }

    #[tokio::test]
    async fn metered_model_refuses_once_the_cap_is_reached() {
        let store = test_datastore();
        let budget = Arc::new(
            BudgetTracker::new(
                store.get_db(),
                BudgetSettings {
                    project: "p".to_string(),
                    session_cap_usd: 1.0,
                    global_cap_usd: None,
                    alert_thresholds: vec![],
                },
            )
            .await
            .unwrap(),
        );
        let model = MeteredModel::new(Arc::new(Fixed), budget.clone());
        let messages = [ChatMessage::user("hi")];
        model.complete(Tier::Chat, "sys", &messages).await.unwrap();

        let err = model.complete(Tier::Chat, "sys", &messages).await.unwrap_err();
        assert!(err.downcast_ref::<BudgetExhausted>().is_some());
        assert_eq!(budget.totals_by_tier().await.unwrap()[0].1.calls, 1);
    }
}
