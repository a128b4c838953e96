//! Learned symptom → fix mappings for failed tool steps.

pub mod symptom;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub use symptom::{BlockerType, classify, normalize_symptom};

#[derive(Debug, Clone, serde::Serialize)]
pub struct BlockerResolution {
    pub id: i64,
    pub symptom: String,
    pub blocker_type: BlockerType,
    pub original_tool: String,
    pub original_error: String,
    pub resolution_tool: String,
    pub resolution_args: Map<String, Value>,
    pub success: bool,
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A resolution attempt to append. The symptom is derived from
/// `original_tool` and `original_error`.
#[derive(Debug, Clone)]
pub struct ResolutionAttempt {
    pub original_tool: String,
    pub original_error: String,
    pub resolution_tool: String,
    pub resolution_args: Map<String, Value>,
    pub task_id: Option<String>,
}

const COLUMNS: &str = "id, symptom, blocker_type, original_tool, original_error, resolution_tool, \
     resolution_args, success, task_id, created_at";

fn row_to_resolution(row: &Row<'_>) -> rusqlite::Result<BlockerResolution> {
    let blocker_type: String = row.get(2)?;
    let args: String = row.get(6)?;
    let created_at: String = row.get(9)?;
    Ok(BlockerResolution {
        id: row.get(0)?,
        symptom: row.get(1)?,
        blocker_type: BlockerType::parse(&blocker_type).unwrap_or(BlockerType::BadPlan),
        original_tool: row.get(3)?,
        original_error: row.get(4)?,
        resolution_tool: row.get(5)?,
        resolution_args: serde_json::from_str(&args).unwrap_or_default(),
        success: row.get::<_, i64>(7)? != 0,
        task_id: row.get(8)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

pub struct BlockerMemory {
    db: Arc<Mutex<Connection>>,
}

impl BlockerMemory {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    async fn append(&self, attempt: &ResolutionAttempt, success: bool) -> Result<i64> {
        let symptom = normalize_symptom(&attempt.original_tool, &attempt.original_error);
        let blocker_type = classify(&attempt.original_error);
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO blocker_resolutions
                 (symptom, blocker_type, original_tool, original_error, resolution_tool, resolution_args, success, task_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                symptom,
                blocker_type.as_str(),
                attempt.original_tool,
                attempt.original_error,
                attempt.resolution_tool,
                serde_json::to_string(&attempt.resolution_args)?,
                success as i64,
                attempt.task_id,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Remember that `resolution_tool` fixed the original failure.
    pub async fn record(&self, attempt: &ResolutionAttempt) -> Result<i64> {
        info!(
            "Learned resolution: {} -> {} ({})",
            attempt.original_tool,
            attempt.resolution_tool,
            classify(&attempt.original_error).as_str()
        );
        self.append(attempt, true).await
    }

    /// Remember that `resolution_tool` did not fix the original failure.
    pub async fn record_failure(&self, attempt: &ResolutionAttempt) -> Result<i64> {
        debug!(
            "Recording failed resolution: {} -> {}",
            attempt.original_tool, attempt.resolution_tool
        );
        self.append(attempt, false).await
    }

    /// Newest successful fix for this exact symptom, else newest for the same
    /// originating tool. Fixes that ever failed for this symptom are skipped.
    pub async fn lookup(&self, tool: &str, error: &str) -> Result<Option<BlockerResolution>> {
        let symptom = normalize_symptom(tool, error);
        let db = self.db.lock().await;
        let exclusion = "resolution_tool NOT IN (
                 SELECT resolution_tool FROM blocker_resolutions WHERE symptom = ?1 AND success = 0)";

        let exact = db
            .query_row(
                &format!(
                    "SELECT {} FROM blocker_resolutions
                     WHERE symptom = ?1 AND success = 1 AND {}
                     ORDER BY id DESC LIMIT 1",
                    COLUMNS, exclusion
                ),
                params![symptom],
                row_to_resolution,
            )
            .optional()?;
        if exact.is_some() {
            return Ok(exact);
        }

        Ok(db
            .query_row(
                &format!(
                    "SELECT {} FROM blocker_resolutions
                     WHERE original_tool = ?2 AND success = 1 AND {}
                     ORDER BY id DESC LIMIT 1",
                    COLUMNS, exclusion
                ),
                params![symptom, tool],
                row_to_resolution,
            )
            .optional()?)
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<BlockerResolution>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM blocker_resolutions ORDER BY id DESC LIMIT ?1",
            COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit as i64], row_to_resolution)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
