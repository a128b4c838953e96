use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::{ChatMessage, FileChange, ModelClient, TaskExecutor, TaskOutcome, extract_json_block};
use crate::core::budget::Tier;
use crate::core::workspace::confine;

const CHANGE_FORMAT: &str = r#"Respond with a single JSON object and nothing else:
{"summary": "<one sentence>", "changes": [{"path": "<relative path>", "content": "<full new file content>"}]}
Paths are relative to the repository root. Every change replaces the whole file."#;

#[derive(serde::Deserialize)]
struct ChangeSet {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    changes: Vec<FileChange>,
}

/// Asks the coding-tier model for whole-file edits and writes them under
/// the workspace root.
pub struct ModelTaskExecutor {
    model: Arc<dyn ModelClient>,
    root: PathBuf,
}

impl ModelTaskExecutor {
    pub fn new(model: Arc<dyn ModelClient>, root: PathBuf) -> Self {
        Self { model, root }
    }
}

fn parse_change_set(text: &str) -> Result<ChangeSet> {
    let json = extract_json_block(text).ok_or_else(|| anyhow!("model returned no JSON change set"))?;
    serde_json::from_str(json).context("malformed change set")
}

#[async_trait]
impl TaskExecutor for ModelTaskExecutor {
    async fn execute_task(&self, system: &str, task: &str) -> Result<TaskOutcome> {
        let system = format!("{}\n\n{}", system, CHANGE_FORMAT);
        let completion = self
            .model
            .complete(Tier::Coding, &system, &[ChatMessage::user(task)])
            .await?;
        let change_set = parse_change_set(&completion.text)?;

        for change in &change_set.changes {
            let target = confine(&self.root, &change.path)?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &change.content)
                .await
                .with_context(|| format!("writing {}", change.path))?;
        }
        info!(
            "Applied {} file change(s): {}",
            change_set.changes.len(),
            change_set.summary
        );

        Ok(TaskOutcome {
            changes: change_set.changes,
            summary: change_set.summary,
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
            model: completion.model,
        })
    }
}
