//! Durable commitments. Status changes are guarded the same way the task
//! ledger guards them: a mismatched current status yields `Ok(None)`.

use anyhow::Result;
use chrono::{DateTime, Duration, DurationRound, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::types::{
    Commitment, CommitmentKind, CommitmentStatus, CommitmentType, ExecuteAt, NewCommitment,
};

const COLUMNS: &str = "id, commitment_type, promise_text, action_description, schedule, execute_at, \
     status, created_at, last_executed_at, next_run_at, execution_count, failure_reason";

/// Statuses that still have work ahead of them.
const OPEN: &str = "'active', 'executing', 'failed'";

#[derive(Debug, thiserror::Error)]
#[error("unknown value '{0}'")]
struct UnknownValue(String);

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|r| {
        DateTime::parse_from_rfc3339(&r)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn row_to_commitment(row: &Row<'_>) -> rusqlite::Result<Commitment> {
    let kind: String = row.get(1)?;
    let status: String = row.get(6)?;
    let execute_at: Option<String> = row.get(5)?;
    Ok(Commitment {
        id: row.get(0)?,
        commitment_type: CommitmentType::parse(&kind)
            .ok_or_else(|| conversion_error(1, UnknownValue(kind.clone())))?,
        promise_text: row.get(2)?,
        action_description: row.get(3)?,
        schedule: row.get(4)?,
        execute_at: execute_at
            .map(|raw| ExecuteAt::parse(&raw).ok_or_else(|| conversion_error(5, UnknownValue(raw.clone()))))
            .transpose()?,
        status: CommitmentStatus::parse(&status)
            .ok_or_else(|| conversion_error(6, UnknownValue(status.clone())))?,
        created_at: parse_opt_ts(7, row.get(7)?)?.unwrap_or_else(Utc::now),
        last_executed_at: parse_opt_ts(8, row.get(8)?)?,
        next_run_at: parse_opt_ts(9, row.get(9)?)?,
        execution_count: row.get(10)?,
        failure_reason: row.get(11)?,
    })
}

fn fetch(db: &Connection, id: &str) -> Result<Option<Commitment>> {
    let sql = format!("SELECT {} FROM commitments WHERE id = ?1", COLUMNS);
    Ok(db.query_row(&sql, params![id], row_to_commitment).optional()?)
}

fn query(db: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Commitment>> {
    let mut stmt = db.prepare(sql)?;
    let rows = stmt.query_map(args, row_to_commitment)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Field {
    Any,
    Every(u32),
    At(u32),
}

impl Field {
    fn parse(raw: &str) -> Option<Field> {
        if raw == "*" {
            return Some(Field::Any);
        }
        if let Some(n) = raw.strip_prefix("*/") {
            return n.parse().ok().filter(|n| *n > 0).map(Field::Every);
        }
        raw.parse().ok().map(Field::At)
    }

    fn matches(self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Every(n) => value % n == 0,
            Field::At(v) => value == v,
        }
    }
}

/// Next run for a five-field schedule, strictly after `now`.
///
/// Only the minute and hour fields are honoured, and only as `*`, `*/N` or a
/// fixed number; day fields are ignored. Anything else runs an hour from now.
/// The scheduler's own timers use a full cron parser; this value is what
/// the store reports and what `get_due` compares against.
pub fn approximate_next_run(schedule: &str, now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let fallback = now + Duration::hours(1);
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    if fields.len() != 5 {
        return fallback;
    }
    let (Some(minute), Some(hour)) = (Field::parse(fields[0]), Field::parse(fields[1])) else {
        return fallback;
    };

    let local = now.with_timezone(&tz).naive_local();
    let base = local.duration_trunc(Duration::minutes(1)).unwrap_or(local);
    for step in 1..=(2 * 24 * 60) {
        let candidate = base + Duration::minutes(step);
        if !(minute.matches(candidate.minute()) && hour.matches(candidate.hour())) {
            continue;
        }
        if let Some(at) = tz.from_local_datetime(&candidate).earliest() {
            let at = at.with_timezone(&Utc);
            if at > now {
                return at;
            }
        }
    }
    fallback
}

pub struct CommitmentStore {
    db: Arc<Mutex<Connection>>,
    tz: Tz,
}

impl CommitmentStore {
    pub fn new(db: Arc<Mutex<Connection>>, tz: Tz) -> Self {
        Self { db, tz }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub async fn create(&self, new: NewCommitment) -> Result<Commitment> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let (kind, schedule, execute_at, next_run_at) = match &new.kind {
            CommitmentKind::OneTime { execute_at } => {
                (CommitmentType::OneTime, None, Some(execute_at.to_string()), None)
            }
            CommitmentKind::Recurring { schedule } => (
                CommitmentType::Recurring,
                Some(schedule.clone()),
                None,
                Some(approximate_next_run(schedule, now, self.tz).to_rfc3339()),
            ),
        };

        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO commitments (id, commitment_type, promise_text, action_description, schedule,
                 execute_at, status, created_at, next_run_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7, ?8)",
            params![
                id,
                kind.as_str(),
                new.promise_text,
                new.action_description,
                schedule,
                execute_at,
                now.to_rfc3339(),
                next_run_at
            ],
        )?;
        info!(
            "Commitment registered: {} [{}] {}",
            id,
            kind.as_str(),
            new.action_description
        );
        fetch(&db, &id)?.ok_or_else(|| anyhow::anyhow!("commitment {} vanished after insert", id))
    }

    pub async fn get(&self, id: &str) -> Result<Option<Commitment>> {
        let db = self.db.lock().await;
        fetch(&db, id)
    }

    pub async fn list(&self, statuses: &[CommitmentStatus]) -> Result<Vec<Commitment>> {
        let db = self.db.lock().await;
        let filter = statuses
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM commitments WHERE status IN ({}) ORDER BY created_at ASC",
            COLUMNS, filter
        );
        query(&db, &sql, &[])
    }

    /// Active, executing and failed commitments: everything not retired.
    pub async fn list_open(&self) -> Result<Vec<Commitment>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM commitments WHERE status IN ({}) ORDER BY created_at ASC",
            COLUMNS, OPEN
        );
        query(&db, &sql, &[])
    }

    /// Active one-time commitments whose time has come (or that run `now`),
    /// and active recurring commitments whose next run has passed.
    pub async fn get_due(&self, now: DateTime<Utc>) -> Result<Vec<Commitment>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM commitments WHERE status = 'active' ORDER BY created_at ASC",
            COLUMNS
        );
        Ok(query(&db, &sql, &[])?
            .into_iter()
            .filter(|c| match c.commitment_type {
                CommitmentType::OneTime => c.execute_at.is_some_and(|at| at.is_due(now)),
                CommitmentType::Recurring => c.next_run_at.is_some_and(|next| next <= now),
            })
            .collect())
    }

    /// active → executing. A failed recurring commitment may also run again
    /// at its next scheduled fire.
    pub async fn mark_executing(&self, id: &str) -> Result<Option<Commitment>> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE commitments SET status = 'executing'
             WHERE id = ?1 AND (status = 'active'
                 OR (status = 'failed' AND commitment_type = 'recurring'))",
            params![id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        fetch(&db, id)
    }

    /// executing → completed for one-time commitments; recurring ones go back
    /// to active with the next run pushed past now.
    pub async fn mark_completed(&self, id: &str) -> Result<Option<Commitment>> {
        let db = self.db.lock().await;
        let Some(current) = fetch(&db, id)? else {
            return Ok(None);
        };
        if current.status != CommitmentStatus::Executing {
            return Ok(None);
        }
        let now = Utc::now();
        let (status, next_run_at) = match &current.schedule {
            Some(schedule) if current.is_recurring() => (
                CommitmentStatus::Active,
                Some(approximate_next_run(schedule, now, self.tz).to_rfc3339()),
            ),
            _ => (CommitmentStatus::Completed, None),
        };
        db.execute(
            "UPDATE commitments SET status = ?2, last_executed_at = ?3, next_run_at = ?4,
                 execution_count = execution_count + 1, failure_reason = NULL
             WHERE id = ?1 AND status = 'executing'",
            params![id, status.as_str(), now.to_rfc3339(), next_run_at],
        )?;
        fetch(&db, id)
    }

    /// executing → failed.
    pub async fn mark_failed(&self, id: &str, reason: &str) -> Result<Option<Commitment>> {
        let db = self.db.lock().await;
        let now = Utc::now();
        let Some(current) = fetch(&db, id)? else {
            return Ok(None);
        };
        let next_run_at = current
            .schedule
            .as_deref()
            .filter(|_| current.is_recurring())
            .map(|s| approximate_next_run(s, now, self.tz).to_rfc3339());
        let changed = db.execute(
            "UPDATE commitments SET status = 'failed', failure_reason = ?2, last_executed_at = ?3,
                 next_run_at = COALESCE(?4, next_run_at)
             WHERE id = ?1 AND status = 'executing'",
            params![id, reason, now.to_rfc3339(), next_run_at],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        warn!("Commitment {} failed: {}", id, reason);
        fetch(&db, id)
    }

    /// active → failed without a run, for a commitment whose schedule can
    /// never fire.
    pub async fn mark_unschedulable(&self, id: &str, reason: &str) -> Result<Option<Commitment>> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE commitments SET status = 'failed', failure_reason = ?2, next_run_at = NULL
             WHERE id = ?1 AND status = 'active'",
            params![id, reason],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        warn!("Commitment {} cannot be scheduled: {}", id, reason);
        fetch(&db, id)
    }

    /// executing → failed for every commitment cut off by an unclean shutdown.
    pub async fn fail_interrupted(&self) -> Result<usize> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE commitments SET status = 'failed', failure_reason = 'interrupted'
             WHERE status = 'executing'",
            [],
        )?;
        if changed > 0 {
            warn!("{} commitment(s) were interrupted mid-run", changed);
        }
        Ok(changed)
    }

    /// Retire a commitment that has not finished.
    pub async fn cancel(&self, id: &str) -> Result<Option<Commitment>> {
        let db = self.db.lock().await;
        let sql = format!(
            "UPDATE commitments SET status = 'cancelled' WHERE id = ?1 AND status IN ({})",
            OPEN
        );
        if db.execute(&sql, params![id])? == 0 {
            return Ok(None);
        }
        info!("Commitment cancelled: {}", id);
        fetch(&db, id)
    }

    /// Cancel the oldest open commitment whose action or promise contains
    /// `text`, ignoring case.
    pub async fn cancel_by_description(&self, text: &str) -> Result<Option<Commitment>> {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(None);
        }
        let target = self.list_open().await?.into_iter().find(|c| {
            c.action_description.to_lowercase().contains(&needle)
                || c.promise_text.to_lowercase().contains(&needle)
        });
        match target {
            Some(c) => self.cancel(&c.id).await,
            None => Ok(None),
        }
    }

    /// failed → active. One-time commitments become due immediately when
    /// their time has already passed.
    pub async fn resume(&self, id: &str) -> Result<Option<Commitment>> {
        let db = self.db.lock().await;
        let changed = db.execute(
            "UPDATE commitments SET status = 'active', failure_reason = NULL
             WHERE id = ?1 AND status = 'failed'",
            params![id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        info!("Commitment resumed: {}", id);
        fetch(&db, id)
    }
}
