//! Doubles shared by unit tests.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::core::budget::Tier;
use crate::core::chat::ChatPort;
use crate::core::llm::{ChatMessage, Completion, ModelClient};
use crate::core::tools::{ParamSpec, RiskLevel, Tool, ToolSpec};

/// Replays canned replies in order and counts calls. An exhausted script
/// answers with an error.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, String>>>,
    calls: AtomicUsize,
    seen_tiers: Mutex<Vec<Tier>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<&str>) -> Self {
        Self::with_results(replies.into_iter().map(|r| Ok(r.to_string())).collect())
    }

    pub fn with_results(replies: Vec<Result<String, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
            seen_tiers: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn tiers(&self) -> Vec<Tier> {
        self.seen_tiers.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(&self, tier: Tier, _: &str, _: &[ChatMessage]) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_tiers.lock().unwrap().push(tier);
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(Completion {
                text,
                input_tokens: 100,
                output_tokens: 20,
                model: "claude-3-5-haiku".to_string(),
                provider: "anthropic".to_string(),
            }),
            Some(Err(e)) => Err(anyhow!(e)),
            None => Err(anyhow!("script exhausted")),
        }
    }
}

/// A tool that answers from a fixed queue of outcomes and counts calls.
/// Once the queue is empty it repeats the last outcome.
pub struct ScriptedTool {
    name: &'static str,
    outcomes: Mutex<VecDeque<Result<String, String>>>,
    last: Mutex<Option<Result<String, String>>>,
    calls: AtomicUsize,
}

impl ScriptedTool {
    pub fn new(name: &'static str, outcomes: Vec<Result<&str, &str>>) -> Self {
        Self {
            name,
            outcomes: Mutex::new(
                outcomes
                    .into_iter()
                    .map(|o| o.map(str::to_string).map_err(str::to_string))
                    .collect(),
            ),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn ok(name: &'static str, output: &str) -> Self {
        Self::new(name, vec![Ok(output)])
    }

    pub fn failing(name: &'static str, error: &str) -> Self {
        Self::new(name, vec![Err(error)])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name,
            description: "scripted test tool",
            params: vec![ParamSpec {
                name: "input",
                description: "anything",
                required: false,
            }],
            risk: RiskLevel::Low,
        }
    }

    async fn execute(&self, _args: &Map<String, Value>) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.outcomes.lock().unwrap().pop_front();
        let outcome = match next {
            Some(o) => {
                *self.last.lock().unwrap() = Some(o.clone());
                o
            }
            None => self
                .last
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Err("no outcome scripted".to_string())),
        };
        outcome.map_err(|e| anyhow!(e))
    }
}

/// Chat transport that keeps everything it was asked to send.
#[derive(Default)]
pub struct RecordingChat {
    sent: Mutex<Vec<String>>,
}

impl RecordingChat {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatPort for RecordingChat {
    async fn send(&self, text: &str) -> Result<()> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }
}
