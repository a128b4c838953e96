//! Durable task ledger.
//!
//! Every mutating call is a conditional `UPDATE ... WHERE status IN (...)`
//! executed while holding the datastore lock. When the guard does not match
//! the call returns `Ok(None)`; callers treat that as "the task changed
//! underneath us" and stop.

pub mod types;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub use types::{Artifact, NewTask, Task, TaskStatus, TaskType, can_transition};

pub const INTERRUPTED_REASON: &str = "interrupted";

const TASK_COLUMNS: &str = "id, title, task_type, status, priority, parent_task_id, deadline, \
     block_reason, checkpoint_data, artifacts, created_at, updated_at, started_at, \
     completed_at, execution_count, last_error";

pub struct TaskLedger {
    db: Arc<Mutex<Connection>>,
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|r| parse_ts(idx, r)).transpose()
}

#[derive(Debug, thiserror::Error)]
#[error("unknown value '{0}'")]
struct UnknownValue(String);

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let task_type: String = row.get(2)?;
    let status: String = row.get(3)?;
    let checkpoint: String = row.get(8)?;
    let artifacts: String = row.get(9)?;
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        task_type: TaskType::parse(&task_type)
            .ok_or_else(|| conversion_error(2, UnknownValue(task_type.clone())))?,
        status: TaskStatus::from_status(&status)
            .ok_or_else(|| conversion_error(3, UnknownValue(status.clone())))?,
        priority: row.get(4)?,
        parent_task_id: row.get(5)?,
        deadline: parse_opt_ts(6, row.get(6)?)?,
        block_reason: row.get(7)?,
        checkpoint_data: serde_json::from_str(&checkpoint).map_err(|e| conversion_error(8, e))?,
        artifacts: serde_json::from_str(&artifacts).map_err(|e| conversion_error(9, e))?,
        created_at: parse_ts(10, row.get(10)?)?,
        updated_at: parse_ts(11, row.get(11)?)?,
        started_at: parse_opt_ts(12, row.get(12)?)?,
        completed_at: parse_opt_ts(13, row.get(13)?)?,
        execution_count: row.get(14)?,
        last_error: row.get(15)?,
    })
}

fn status_in(allowed: &[TaskStatus]) -> String {
    allowed
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Every status `to` may be entered from.
fn sources_of(to: TaskStatus) -> String {
    let from: Vec<TaskStatus> = TaskStatus::ALL
        .into_iter()
        .filter(|from| can_transition(*from, to))
        .collect();
    status_in(&from)
}

/// Statuses whose data bags may still change.
const WORKING: [TaskStatus; 2] = [TaskStatus::Running, TaskStatus::Blocked];

fn fetch(db: &Connection, id: &str) -> Result<Option<Task>> {
    let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
    Ok(db.query_row(&sql, params![id], row_to_task).optional()?)
}

fn query_tasks(db: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Task>> {
    let mut stmt = db.prepare(sql)?;
    let rows = stmt.query_map(args, row_to_task)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

impl TaskLedger {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub async fn create(&self, new_task: NewTask) -> Result<Task> {
        let id = uuid::Uuid::new_v4().to_string();
        let ts = now();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO tasks (id, title, task_type, status, priority, parent_task_id, deadline, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'queued', ?4, ?5, ?6, ?7, ?7)",
            params![
                id,
                new_task.title,
                new_task.task_type.as_str(),
                new_task.priority,
                new_task.parent_task_id,
                new_task.deadline.map(|d| d.to_rfc3339()),
                ts
            ],
        )?;
        info!("Task created: {} [{}] {}", id, new_task.task_type.as_str(), new_task.title);
        fetch(&db, &id)?.ok_or_else(|| anyhow::anyhow!("task {} vanished after insert", id))
    }

    /// queued|blocked → running. Increments the execution count.
    pub async fn start(&self, id: &str) -> Result<Option<Task>> {
        let db = self.db.lock().await;
        let sql = format!(
            "UPDATE tasks SET status = 'running', started_at = ?2, updated_at = ?2,
                 execution_count = execution_count + 1, block_reason = NULL
             WHERE id = ?1 AND status IN ({})",
            sources_of(TaskStatus::Running)
        );
        if db.execute(&sql, params![id, now()])? == 0 {
            return Ok(None);
        }
        fetch(&db, id)
    }

    /// Shallow-merge `data` into the task's checkpoint bag.
    pub async fn checkpoint(&self, id: &str, data: Map<String, Value>) -> Result<Option<Task>> {
        let db = self.db.lock().await;
        let Some(current) = fetch(&db, id)? else {
            return Ok(None);
        };
        if !WORKING.contains(&current.status) {
            return Ok(None);
        }
        let mut merged = current.checkpoint_data;
        for (key, value) in data {
            merged.insert(key, value);
        }
        let sql = format!(
            "UPDATE tasks SET checkpoint_data = ?2, updated_at = ?3 WHERE id = ?1 AND status IN ({})",
            status_in(&WORKING)
        );
        let json = serde_json::to_string(&merged)?;
        if db.execute(&sql, params![id, json, now()])? == 0 {
            return Ok(None);
        }
        fetch(&db, id)
    }

    /// running → blocked.
    pub async fn block(&self, id: &str, reason: &str) -> Result<Option<Task>> {
        let db = self.db.lock().await;
        let sql = format!(
            "UPDATE tasks SET status = 'blocked', block_reason = ?2, updated_at = ?3
             WHERE id = ?1 AND status IN ({})",
            sources_of(TaskStatus::Blocked)
        );
        if db.execute(&sql, params![id, reason, now()])? == 0 {
            return Ok(None);
        }
        fetch(&db, id)
    }

    /// running|blocked → done, appending `artifacts`.
    pub async fn complete(&self, id: &str, artifacts: Vec<Artifact>) -> Result<Option<Task>> {
        let db = self.db.lock().await;
        let Some(current) = fetch(&db, id)? else {
            return Ok(None);
        };
        if !can_transition(current.status, TaskStatus::Done) {
            return Ok(None);
        }
        let mut all = current.artifacts;
        all.extend(artifacts);
        let ts = now();
        let sql = format!(
            "UPDATE tasks SET status = 'done', artifacts = ?2, block_reason = NULL,
                 completed_at = ?3, updated_at = ?3
             WHERE id = ?1 AND status IN ({})",
            sources_of(TaskStatus::Done)
        );
        if db.execute(&sql, params![id, serde_json::to_string(&all)?, ts])? == 0 {
            return Ok(None);
        }
        fetch(&db, id)
    }

    /// running|blocked → failed.
    pub async fn fail(&self, id: &str, error: &str) -> Result<Option<Task>> {
        let db = self.db.lock().await;
        let ts = now();
        let sql = format!(
            "UPDATE tasks SET status = 'failed', last_error = ?2, block_reason = NULL,
                 completed_at = ?3, updated_at = ?3
             WHERE id = ?1 AND status IN ({})",
            sources_of(TaskStatus::Failed)
        );
        if db.execute(&sql, params![id, error, ts])? == 0 {
            return Ok(None);
        }
        fetch(&db, id)
    }

    /// blocked|failed → queued.
    pub async fn resume(&self, id: &str) -> Result<Option<Task>> {
        let db = self.db.lock().await;
        let sql = format!(
            "UPDATE tasks SET status = 'queued', block_reason = NULL, completed_at = NULL, updated_at = ?2
             WHERE id = ?1 AND status IN ({})",
            sources_of(TaskStatus::Queued)
        );
        if db.execute(&sql, params![id, now()])? == 0 {
            return Ok(None);
        }
        info!("Task resumed: {}", id);
        fetch(&db, id)
    }

    /// Append one artifact to a running or blocked task.
    pub async fn add_artifact(&self, id: &str, artifact: Artifact) -> Result<Option<Task>> {
        let db = self.db.lock().await;
        let Some(current) = fetch(&db, id)? else {
            return Ok(None);
        };
        if !WORKING.contains(&current.status) {
            return Ok(None);
        }
        let mut all = current.artifacts;
        all.push(artifact);
        let sql = format!(
            "UPDATE tasks SET artifacts = ?2, updated_at = ?3 WHERE id = ?1 AND status IN ({})",
            status_in(&WORKING)
        );
        if db.execute(&sql, params![id, serde_json::to_string(&all)?, now()])? == 0 {
            return Ok(None);
        }
        fetch(&db, id)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Task>> {
        let db = self.db.lock().await;
        fetch(&db, id)
    }

    pub async fn list_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM tasks WHERE status IN ({}) ORDER BY priority DESC, created_at ASC",
            TASK_COLUMNS,
            status_in(statuses)
        );
        query_tasks(&db, &sql, &[])
    }

    pub async fn active(&self) -> Result<Vec<Task>> {
        self.list_by_status(&[TaskStatus::Queued, TaskStatus::Running, TaskStatus::Blocked])
            .await
    }

    pub async fn subtasks(&self, parent_id: &str) -> Result<Vec<Task>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM tasks WHERE parent_task_id = ?1 ORDER BY created_at ASC",
            TASK_COLUMNS
        );
        query_tasks(&db, &sql, &[&parent_id])
    }

    /// Tasks left in `running`. Only meaningful before any pipeline starts.
    pub async fn interrupted(&self) -> Result<Vec<Task>> {
        self.list_by_status(&[TaskStatus::Running]).await
    }

    /// Move every interrupted task to `blocked` so the operator can resume it.
    pub async fn block_interrupted(&self) -> Result<Vec<Task>> {
        let mut blocked = Vec::new();
        for task in self.interrupted().await? {
            match self.block(&task.id, INTERRUPTED_REASON).await? {
                Some(t) => {
                    warn!("Task {} was interrupted by an unclean shutdown", t.id);
                    blocked.push(t);
                }
                None => warn!("Interrupted task {} changed state concurrently", task.id),
            }
        }
        Ok(blocked)
    }

    pub async fn status_counts(&self) -> Result<HashMap<TaskStatus, usize>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts: HashMap<TaskStatus, usize> =
            TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for row in rows {
            let (status, count) = row?;
            if let Some(s) = TaskStatus::from_status(&status) {
                counts.insert(s, count as usize);
            }
        }
        Ok(counts)
    }

    /// Highest priority queued task; earlier deadlines, then older tasks, win ties.
    pub async fn next_queued(&self) -> Result<Option<Task>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM tasks WHERE status = 'queued'
             ORDER BY priority DESC, deadline IS NULL, deadline ASC, created_at ASC LIMIT 1",
            TASK_COLUMNS
        );
        Ok(query_tasks(&db, &sql, &[])?.into_iter().next())
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<Task>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM tasks ORDER BY updated_at DESC LIMIT ?1",
            TASK_COLUMNS
        );
        query_tasks(&db, &sql, &[&(limit as i64)])
    }
}

#[cfg(test)]
mod tests;
