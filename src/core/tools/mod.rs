//! Tool registry: the fixed set of actions a plan step may invoke.

pub mod builtins;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub required: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
    pub risk: RiskLevel,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn execute(&self, args: &Map<String, Value>) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ToolResult {
    fn failure(error: String, started: Instant) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Generic substitutes tried when a tool fails and nothing better is known.
static FALLBACKS: &[(&str, &str)] = &[("web_fetch", "browser_fetch")];

pub fn fallback_for(tool: &str) -> Option<&'static str> {
    FALLBACKS
        .iter()
        .find(|(from, _)| *from == tool)
        .map(|(_, to)| *to)
}

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    timeout: Duration,
}

impl ToolRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tools: HashMap::new(),
            timeout,
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let spec = tool.spec();
        info!("Registering tool: {} ({} risk)", spec.name, spec.risk.as_str());
        self.tools.insert(spec.name.to_string(), tool);
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Specs sorted by name.
    pub fn manifest(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.spec()).collect();
        specs.sort_by_key(|s| s.name);
        specs
    }

    /// Human-readable catalog for planner prompts.
    pub fn catalog(&self) -> String {
        let mut catalog = String::new();
        for spec in self.manifest() {
            catalog.push_str(&format!(
                "### {} [{} risk]\n{}\n",
                spec.name,
                spec.risk.as_str(),
                spec.description
            ));
            for p in &spec.params {
                catalog.push_str(&format!(
                    "- {}{}: {}\n",
                    p.name,
                    if p.required { " (required)" } else { "" },
                    p.description
                ));
            }
            catalog.push('\n');
        }
        catalog
    }

    /// Runs a tool under the registry timeout. Unknown tools and missing
    /// required parameters fail without invoking anything.
    pub async fn execute(&self, name: &str, args: &Map<String, Value>) -> ToolResult {
        let started = Instant::now();
        let Some(tool) = self.tools.get(name) else {
            return ToolResult::failure(format!("unknown tool: {}", name), started);
        };

        let spec = tool.spec();
        let missing: Vec<&str> = spec
            .params
            .iter()
            .filter(|p| p.required && args.get(p.name).is_none_or(Value::is_null))
            .map(|p| p.name)
            .collect();
        if !missing.is_empty() {
            return ToolResult::failure(
                format!(
                    "missing required parameter(s) for {}: {}",
                    name,
                    missing.join(", ")
                ),
                started,
            );
        }

        match tokio::time::timeout(self.timeout, tool.execute(args)).await {
            Ok(Ok(output)) => ToolResult {
                success: true,
                output,
                error: None,
                duration_ms: started.elapsed().as_millis() as u64,
            },
            Ok(Err(e)) => {
                warn!("Tool {} failed: {}", name, e);
                ToolResult::failure(e.to_string(), started)
            }
            Err(_) => {
                warn!("Tool {} timed out after {:?}", name, self.timeout);
                ToolResult::failure(
                    format!("{} timed out after {}s", name, self.timeout.as_secs()),
                    started,
                )
            }
        }
    }
}

/// String argument helper for tool implementations.
pub(crate) fn str_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("parameter '{}' must be a string", key))
}
