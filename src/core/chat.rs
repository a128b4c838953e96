//! Outbound side of the operator chat.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::core::pipeline::{Phase, ProgressEvent, ProgressSink};

const ERROR_CHARS: usize = 300;

#[async_trait]
pub trait ChatPort: Send + Sync {
    async fn send(&self, text: &str) -> Result<()>;
}

/// Used when no chat transport is configured.
pub struct LogChat;

#[async_trait]
impl ChatPort for LogChat {
    async fn send(&self, text: &str) -> Result<()> {
        info!("[chat] {}", text);
        Ok(())
    }
}

/// Structured error report: what failed, for which task, and a clipped error.
pub fn error_report(what: &str, task_id: Option<&str>, error: &str) -> String {
    let mut clipped: String = error.chars().take(ERROR_CHARS).collect();
    if error.chars().count() > ERROR_CHARS {
        clipped.push('…');
    }
    match task_id {
        Some(id) => format!("❌ {} (task {})\n{}", what, id, clipped),
        None => format!("❌ {}\n{}", what, clipped),
    }
}

/// Forwards phase changes and step results to the chat.
pub struct ChatProgress {
    chat: Arc<dyn ChatPort>,
}

impl ChatProgress {
    pub fn new(chat: Arc<dyn ChatPort>) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl ProgressSink for ChatProgress {
    async fn emit(&self, event: &ProgressEvent) -> Result<()> {
        let text = match (&event.step_index, &event.step_name) {
            (Some(i), Some(name)) => {
                let mut line = format!("▸ step {}: {} ({})", i + 1, name, event.action);
                if let Some(next) = &event.next_step {
                    line.push_str(&format!("\n  next: {}", next));
                }
                line
            }
            _ => match event.phase {
                Phase::Planning => format!("🗺 planning task {}", event.task_id),
                Phase::Executing => format!("⚙️ executing task {}", event.task_id),
                Phase::Verifying => format!("🔎 verifying task {}", event.task_id),
                Phase::Persisting => format!("💾 persisting task {}", event.task_id),
            },
        };
        self.chat.send(&text).await
    }
}
