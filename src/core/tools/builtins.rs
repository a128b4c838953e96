use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tracing::info;

use super::{ParamSpec, RiskLevel, Tool, ToolSpec, str_arg};
use crate::core::llm::TaskExecutor;
use crate::core::workspace::confine;

const MAX_OUTPUT_CHARS: usize = 20_000;

fn clip(text: String) -> String {
    if text.chars().count() <= MAX_OUTPUT_CHARS {
        return text;
    }
    let mut clipped: String = text.chars().take(MAX_OUTPUT_CHARS).collect();
    clipped.push_str("\n[truncated]");
    clipped
}

const URL_PARAM: ParamSpec = ParamSpec {
    name: "url",
    description: "Absolute http(s) URL",
    required: true,
};

/// Plain HTTP GET.
pub struct WebFetch {
    client: Client,
}

impl WebFetch {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("nightshift/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Tool for WebFetch {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "web_fetch",
            description: "Fetch a URL over plain HTTP and return the response body.",
            params: vec![URL_PARAM],
            risk: RiskLevel::Low,
        }
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<String> {
        let url = str_arg(args, "url")?;
        let res = self.client.get(url).send().await?;
        let status = res.status();
        if !status.is_success() {
            return Err(anyhow!("HTTP {} from {}", status, url));
        }
        Ok(clip(res.text().await?))
    }
}

/// Fetch through a headless browser so scripted pages and bot walls render.
pub struct BrowserFetch {
    command: String,
}

impl BrowserFetch {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Tool for BrowserFetch {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "browser_fetch",
            description: "Render a URL in a headless browser and return the DOM.",
            params: vec![URL_PARAM],
            risk: RiskLevel::Medium,
        }
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<String> {
        let url = str_arg(args, "url")?;
        let output = Command::new(&self.command)
            .args(["--headless", "--disable-gpu", "--dump-dom", url])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    anyhow!("{}: command not found", self.command)
                }
                _ => anyhow!("failed to launch {}: {}", self.command, e),
            })?;
        if !output.status.success() {
            return Err(anyhow!(
                "browser exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(clip(String::from_utf8_lossy(&output.stdout).to_string()))
    }
}

/// `sh -c` inside the workspace root.
pub struct Shell {
    cwd: PathBuf,
}

impl Shell {
    pub fn new(cwd: PathBuf) -> Self {
        Self { cwd }
    }
}

#[async_trait]
impl Tool for Shell {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "shell",
            description: "Run a shell command in the workspace and return stdout.",
            params: vec![ParamSpec {
                name: "command",
                description: "Command line passed to sh -c",
                required: true,
            }],
            risk: RiskLevel::High,
        }
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<String> {
        let command = str_arg(args, "command")?;
        info!("Shell tool: {}", command);
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.cwd)
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(anyhow!(
                "command exited with {}: {} {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
                String::from_utf8_lossy(&output.stdout).trim()
            ));
        }
        Ok(clip(String::from_utf8_lossy(&output.stdout).to_string()))
    }
}

const PATH_PARAM: ParamSpec = ParamSpec {
    name: "path",
    description: "Path relative to the workspace root",
    required: true,
};

pub struct ReadFile {
    root: PathBuf,
}

impl ReadFile {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for ReadFile {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "read_file",
            description: "Read a text file from the workspace.",
            params: vec![PATH_PARAM],
            risk: RiskLevel::Low,
        }
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<String> {
        let rel = str_arg(args, "path")?;
        let path = confine(&self.root, rel)?;
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", rel))?;
        Ok(clip(text))
    }
}

pub struct WriteFile {
    root: PathBuf,
}

impl WriteFile {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for WriteFile {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "write_file",
            description: "Create or overwrite a text file in the workspace.",
            params: vec![
                PATH_PARAM,
                ParamSpec {
                    name: "content",
                    description: "Full file content",
                    required: true,
                },
            ],
            risk: RiskLevel::Medium,
        }
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<String> {
        let rel = str_arg(args, "path")?;
        let content = str_arg(args, "content")?;
        let path = confine(&self.root, rel)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("writing {}", rel))?;
        Ok(format!("wrote {} bytes to {}", content.len(), rel))
    }
}

pub struct ListDir {
    root: PathBuf,
}

impl ListDir {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for ListDir {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "list_dir",
            description: "List entries of a workspace directory (defaults to the root).",
            params: vec![ParamSpec {
                name: "path",
                description: "Directory relative to the workspace root",
                required: false,
            }],
            risk: RiskLevel::Low,
        }
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<String> {
        let rel = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let dir = confine(&self.root, rel)?;
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("listing {}", rel))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let mut name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type().await?.is_dir() {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();
        Ok(names.join("\n"))
    }
}

/// Delegates file-mutating work to the coding-tier executor.
pub struct CodeEdit {
    executor: Arc<dyn TaskExecutor>,
}

impl CodeEdit {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self { executor }
    }
}

const CODE_EDIT_SYSTEM: &str = "You are editing a source repository unattended. \
     Make the smallest change that satisfies the instructions and keep the build green.";

#[async_trait]
impl Tool for CodeEdit {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "code_edit",
            description: "Have the coding model change files in the workspace according to instructions.",
            params: vec![ParamSpec {
                name: "instructions",
                description: "What to change and why",
                required: true,
            }],
            risk: RiskLevel::High,
        }
    }

    async fn execute(&self, args: &Map<String, Value>) -> Result<String> {
        let instructions = str_arg(args, "instructions")?;
        let outcome = self
            .executor
            .execute_task(CODE_EDIT_SYSTEM, instructions)
            .await?;
        let files: Vec<&str> = outcome.changes.iter().map(|c| c.path.as_str()).collect();
        Ok(format!(
            "{} (changed: {})",
            outcome.summary,
            if files.is_empty() {
                "nothing".to_string()
            } else {
                files.join(", ")
            }
        ))
    }
}
