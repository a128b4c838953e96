//! Operator commands, independent of the chat transport that carries them.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::budget::{BudgetTracker, Tier};
use crate::core::commitments::{self, CommitmentScheduler, CommitmentStatus};
use crate::core::ledger::{NewTask, TaskLedger, TaskStatus, TaskType};
use crate::core::llm::{ChatMessage, ModelClient};
use crate::core::scheduler::Scheduler;
use crate::logging::LogTail;

const HISTORY_MESSAGES: usize = 20;
const DEFAULT_LOG_LINES: usize = 20;
const MAX_LOG_LINES: usize = 100;
const LIST_LIMIT: usize = 10;
// Telegram rejects messages above 4096 characters.
const REPLY_CHARS: usize = 4_000;

const BUDGET_EXHAUSTED_REPLY: &str =
    "⏸ Budget exhausted: I can't answer free text until the budget allows more. Commands still work, see /budget.";

const CHAT_SYSTEM: &str = "You are nightshift, an agent that works through a task backlog \
unattended during the night. You are talking to your operator. Be brief. When you promise \
to do something later, say so plainly with the time, e.g. \"I'll check the build tomorrow at 9am\".";

const HELP: &str = "🌙 nightshift commands
/status  backlog, budget and scheduler state
/tasks  recent tasks
/add [--type T] [--priority N] <title>  queue a task
/resume <id>  requeue a blocked/failed task or reactivate a failed commitment
/commitments  open commitments
/cancel <id or text>  cancel a commitment
/budget  spend so far
/logs [n]  last log lines
/pause, /unpause  stop or resume picking work
Anything else is a message to the agent.";

#[derive(Debug, Clone, PartialEq)]
struct AddArgs {
    title: String,
    task_type: TaskType,
    priority: i64,
}

fn parse_add(args: &[&str]) -> Result<AddArgs, String> {
    let mut task_type = TaskType::General;
    let mut priority = 0;
    let mut title = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i] {
            "--type" | "-t" => {
                let value = args.get(i + 1).ok_or("--type needs a value")?;
                task_type = TaskType::parse(value).ok_or_else(|| {
                    format!("unknown task type '{}' (commitment, research, coding, general)", value)
                })?;
                i += 2;
            }
            "--priority" | "-p" => {
                let value = args.get(i + 1).ok_or("--priority needs a value")?;
                priority = value
                    .parse()
                    .map_err(|_| format!("priority must be a number, got '{}'", value))?;
                i += 2;
            }
            word => {
                title.push(word);
                i += 1;
            }
        }
    }
    if title.is_empty() {
        return Err("usage: /add [--type T] [--priority N] <title>".to_string());
    }
    Ok(AddArgs {
        title: title.join(" "),
        task_type,
        priority,
    })
}

fn clip_reply(mut text: String) -> String {
    if text.chars().count() > REPLY_CHARS {
        let keep: String = text.chars().skip(text.chars().count() - REPLY_CHARS).collect();
        text = format!("…{}", keep);
    }
    text
}

pub struct ControlHandler {
    ledger: Arc<TaskLedger>,
    budget: Arc<BudgetTracker>,
    heartbeat: Arc<Scheduler>,
    commitments: Arc<CommitmentScheduler>,
    model: Arc<dyn ModelClient>,
    logs: LogTail,
    history: Mutex<VecDeque<ChatMessage>>,
}

impl ControlHandler {
    pub fn new(
        ledger: Arc<TaskLedger>,
        budget: Arc<BudgetTracker>,
        heartbeat: Arc<Scheduler>,
        commitments: Arc<CommitmentScheduler>,
        model: Arc<dyn ModelClient>,
        logs: LogTail,
    ) -> Self {
        Self {
            ledger,
            budget,
            heartbeat,
            commitments,
            model,
            logs,
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Reply to one inbound message.
    pub async fn handle(&self, text: &str) -> Result<String> {
        self.handle_at(text, Utc::now()).await
    }

    pub async fn handle_at(&self, text: &str, now: DateTime<Utc>) -> Result<String> {
        let text = text.trim();
        let Some(command) = text.strip_prefix('/') else {
            return self.converse(text, now).await;
        };
        let mut words = command.split_whitespace();
        // Telegram appends the bot name in groups: /status@nightshift_bot
        let name = words
            .next()
            .unwrap_or("")
            .split('@')
            .next()
            .unwrap_or("")
            .to_lowercase();
        let args: Vec<&str> = words.collect();
        info!("Control command: /{}", name);

        let reply = match name.as_str() {
            "help" | "start" => HELP.to_string(),
            "status" => self.status().await?,
            "tasks" => self.tasks().await?,
            "add" => self.add(&args).await?,
            "resume" => self.resume(&args).await?,
            "commitments" => self.list_commitments().await?,
            "cancel" => self.cancel(&args).await?,
            "budget" => self.budget_report().await?,
            "logs" => self.logs(&args),
            "pause" => {
                self.heartbeat.set_paused(true);
                "⏸ Paused. No new tasks will be picked until /unpause.".to_string()
            }
            "unpause" => {
                self.heartbeat.set_paused(false);
                "▶️ Unpaused.".to_string()
            }
            other => format!("Unknown command /{}. Try /help.", other),
        };
        Ok(clip_reply(reply))
    }

    async fn status(&self) -> Result<String> {
        let counts = self.ledger.status_counts().await?;
        let budget = self.budget.summary().await?;
        let heartbeat = self.heartbeat.status().await;
        let open = self.commitments.store().list_open().await?.len();

        let backlog = TaskStatus::ALL
            .iter()
            .map(|s| format!("{} {}", counts.get(s).copied().unwrap_or(0), s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let state = match (heartbeat.running, heartbeat.paused, heartbeat.busy) {
            (false, _, _) => "stopped",
            (true, true, _) => "paused",
            (true, false, true) => "working",
            (true, false, false) if heartbeat.in_window => "waiting for the next heartbeat",
            _ => "outside active hours",
        };
        Ok(format!(
            "📋 Tasks: {}\n💰 Session ${:.2} / ${:.2}{}\n⏱ Heartbeat: {}\n📌 Commitments: {} open ({})",
            backlog,
            budget.session_spent,
            budget.session_cap,
            if budget.can_proceed { "" } else { " (exhausted)" },
            state,
            open,
            if self.commitments.is_running().await {
                "scheduler running"
            } else {
                "scheduler stopped"
            }
        ))
    }

    async fn tasks(&self) -> Result<String> {
        let tasks = self.ledger.list_recent(LIST_LIMIT).await?;
        if tasks.is_empty() {
            return Ok("No tasks yet. Queue one with /add <title>.".to_string());
        }
        let lines: Vec<String> = tasks
            .iter()
            .map(|t| {
                let mut line = format!(
                    "• [{}] {} ({}, p{}) {}",
                    t.status.as_str(),
                    t.title,
                    t.task_type.as_str(),
                    t.priority,
                    t.id
                );
                if let Some(reason) = t.status_reason() {
                    line.push_str(&format!("\n    {}", reason));
                }
                line
            })
            .collect();
        Ok(lines.join("\n"))
    }

    async fn add(&self, args: &[&str]) -> Result<String> {
        let parsed = match parse_add(args) {
            Ok(p) => p,
            Err(usage) => return Ok(usage),
        };
        let task = self
            .ledger
            .create(NewTask::new(parsed.title, parsed.task_type).priority(parsed.priority))
            .await?;
        Ok(format!(
            "➕ Queued {} task {} (priority {}): {}",
            task.task_type.as_str(),
            task.id,
            task.priority,
            task.title
        ))
    }

    async fn resume(&self, args: &[&str]) -> Result<String> {
        let Some(id) = args.first() else {
            return Ok("usage: /resume <task or commitment id>".to_string());
        };
        if let Some(task) = self.ledger.resume(id).await? {
            return Ok(format!("🔁 Requeued: {}", task.title));
        }
        if let Some(c) = self.commitments.store().resume(id).await? {
            return Ok(format!("🔁 Reactivated commitment: {}", c.action_description));
        }
        Ok(format!("Nothing to resume with id {} (only blocked or failed work can be resumed).", id))
    }

    async fn list_commitments(&self) -> Result<String> {
        let open = self.commitments.store().list_open().await?;
        if open.is_empty() {
            return Ok("No open commitments.".to_string());
        }
        let lines: Vec<String> = open
            .iter()
            .map(|c| {
                let schedule = c.schedule.as_deref().map(|s| format!(" [{}]", s)).unwrap_or_default();
                let mut line = format!(
                    "• {} ({}{}, next {}) {}",
                    c.action_description,
                    c.status.as_str(),
                    schedule,
                    c.when(),
                    c.id
                );
                if let Some(reason) = &c.failure_reason {
                    line.push_str(&format!("\n    {}", reason));
                }
                line
            })
            .collect();
        Ok(lines.join("\n"))
    }

    async fn cancel(&self, args: &[&str]) -> Result<String> {
        if args.is_empty() {
            return Ok("usage: /cancel <commitment id or part of its description>".to_string());
        }
        let query = args.join(" ");
        let cancelled = match self.commitments.cancel(&query).await? {
            Some(c) => Some(c),
            None => self.commitments.cancel_by_description(&query).await?,
        };
        Ok(match cancelled {
            Some(c) => format!("🗑 Cancelled: {}", c.action_description),
            None => format!("No open commitment matches '{}'.", query),
        })
    }

    async fn budget_report(&self) -> Result<String> {
        let summary = self.budget.summary().await?;
        let mut text = format!(
            "💰 Session: ${:.4} of ${:.2}\n🌍 All time: ${:.4}{}",
            summary.session_spent,
            summary.session_cap,
            summary.global_spent,
            summary
                .global_cap
                .map(|cap| format!(" of ${:.2}", cap))
                .unwrap_or_default()
        );
        let tiers = self.budget.session_totals_by_tier().await?;
        if !tiers.is_empty() {
            text.push_str("\n\nThis session by tier:");
            for (tier, totals) in tiers {
                text.push_str(&format!(
                    "\n• {}: {} call(s), ${:.4}",
                    tier, totals.calls, totals.cost_usd
                ));
            }
        }
        if !summary.can_proceed {
            text.push_str("\n\n⏸ Cap reached: no new work will be picked.");
        }
        Ok(text)
    }

    fn logs(&self, args: &[&str]) -> String {
        let n = args
            .first()
            .and_then(|a| a.parse::<usize>().ok())
            .unwrap_or(DEFAULT_LOG_LINES)
            .min(MAX_LOG_LINES);
        let lines = self.logs.recent(n);
        if lines.is_empty() {
            "No log lines yet.".to_string()
        } else {
            lines.join("\n")
        }
    }

    /// Free text goes to the model; a promise in its reply becomes a
    /// commitment.
    async fn converse(&self, text: &str, now: DateTime<Utc>) -> Result<String> {
        if text.is_empty() {
            return Ok(HELP.to_string());
        }
        if !self.budget.can_proceed().await? {
            info!("Chat message not sent to the model: budget exhausted");
            return Ok(BUDGET_EXHAUSTED_REPLY.to_string());
        }
        let messages: Vec<ChatMessage> = {
            let mut history = self.history.lock().await;
            history.push_back(ChatMessage::user(text));
            while history.len() > HISTORY_MESSAGES {
                history.pop_front();
            }
            history.iter().cloned().collect()
        };

        let completion = self.model.complete(Tier::Chat, CHAT_SYSTEM, &messages).await?;
        let mut reply = completion.text.trim().to_string();
        {
            let mut history = self.history.lock().await;
            history.push_back(ChatMessage::assistant(reply.clone()));
            while history.len() > HISTORY_MESSAGES {
                history.pop_front();
            }
        }

        let tz = self.commitments.store().timezone();
        if let Some(found) = commitments::detect(&reply, now.with_timezone(&tz)) {
            match self.commitments.register(found).await {
                Ok(c) if c.status == CommitmentStatus::Failed => reply.push_str(&format!(
                    "\n\n⚠️ Could not schedule: {} ({})",
                    c.action_description,
                    c.failure_reason.as_deref().unwrap_or("unknown reason")
                )),
                Ok(c) => reply.push_str(&format!(
                    "\n\n📌 Scheduled: {} ({})",
                    c.action_description,
                    c.schedule.clone().unwrap_or_else(|| c.when())
                )),
                Err(e) => warn!("Could not store detected commitment: {}", e),
            }
        }
        Ok(clip_reply(reply))
    }
}
