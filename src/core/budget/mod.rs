//! Per-call cost metering with session and lifetime caps.

pub mod pricing;

use anyhow::Result;
use chrono::Utc;
use rusqlite::{Connection, params};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Purpose bucket of a model call, used for cost attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Background,
    Chat,
    Planning,
    Coding,
    Review,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Background => "background",
            Tier::Chat => "chat",
            Tier::Planning => "planning",
            Tier::Coding => "coding",
            Tier::Review => "review",
        }
    }

    pub const ALL: [Tier; 5] = [Tier::Background, Tier::Chat, Tier::Planning, Tier::Coding, Tier::Review];

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

#[derive(Debug, Clone)]
pub struct BudgetSettings {
    pub project: String,
    pub session_cap_usd: f64,
    pub global_cap_usd: Option<f64>,
    pub alert_thresholds: Vec<u32>,
}

/// One model call as reported by a backend.
#[derive(Debug, Clone)]
pub struct Usage {
    pub tier: Tier,
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct UsageRecord {
    pub id: i64,
    pub session_id: String,
    pub project: String,
    pub tier: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct UsageTotals {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdAlert {
    pub percent: u32,
    pub spent_usd: f64,
    pub cap_usd: f64,
}

#[derive(Debug, Clone)]
pub struct BudgetSummary {
    pub session_spent: f64,
    pub session_cap: f64,
    pub global_spent: f64,
    pub global_cap: Option<f64>,
    pub can_proceed: bool,
}

/// Raised instead of spending once a cap is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("budget exhausted: no model calls until the cap allows more")]
pub struct BudgetExhausted;

pub struct BudgetTracker {
    db: Arc<Mutex<Connection>>,
    session_id: String,
    settings: BudgetSettings,
    // In-process only: a restart re-arms every threshold.
    fired_thresholds: std::sync::Mutex<HashSet<u32>>,
}

fn sum_cost(db: &Connection, session_id: Option<&str>) -> Result<f64> {
    let total: f64 = match session_id {
        Some(sid) => db.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0.0) FROM usage_tracking WHERE session_id = ?1",
            params![sid],
            |row| row.get(0),
        )?,
        None => db.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0.0) FROM usage_tracking",
            [],
            |row| row.get(0),
        )?,
    };
    Ok(total)
}

/// Total recorded spend, without opening a session.
pub async fn spend_to_date(db: &Arc<Mutex<Connection>>) -> Result<f64> {
    let db = db.lock().await;
    sum_cost(&db, None)
}

impl BudgetTracker {
    /// Opens a new metering session.
    pub async fn new(db: Arc<Mutex<Connection>>, settings: BudgetSettings) -> Result<Self> {
        let session_id = uuid::Uuid::new_v4().to_string();
        {
            let conn = db.lock().await;
            conn.execute(
                "INSERT INTO sessions (id, project, started_at) VALUES (?1, ?2, ?3)",
                params![session_id, settings.project, Utc::now().to_rfc3339()],
            )?;
        }
        info!(
            "Budget session {} opened (session cap ${:.2}, global cap {})",
            session_id,
            settings.session_cap_usd,
            settings
                .global_cap_usd
                .map(|c| format!("${:.2}", c))
                .unwrap_or_else(|| "none".to_string())
        );
        Ok(Self {
            db,
            session_id,
            settings,
            fired_thresholds: std::sync::Mutex::new(HashSet::new()),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn record_usage(&self, usage: Usage) -> Result<UsageRecord> {
        let cost = pricing::cost_usd(&usage.model, usage.input_tokens, usage.output_tokens);
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO usage_tracking (session_id, project, tier, provider, model, input_tokens, output_tokens, cost_usd, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                self.session_id,
                self.settings.project,
                usage.tier.as_str(),
                usage.provider,
                usage.model,
                usage.input_tokens as i64,
                usage.output_tokens as i64,
                cost,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(UsageRecord {
            id: db.last_insert_rowid(),
            session_id: self.session_id.clone(),
            project: self.settings.project.clone(),
            tier: usage.tier.as_str().to_string(),
            provider: usage.provider,
            model: usage.model,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost_usd: cost,
        })
    }

    pub async fn session_total(&self) -> Result<f64> {
        let db = self.db.lock().await;
        sum_cost(&db, Some(&self.session_id))
    }

    pub async fn global_total(&self) -> Result<f64> {
        let db = self.db.lock().await;
        sum_cost(&db, None)
    }

    /// True only while every configured cap is strictly above its spend.
    pub async fn can_proceed(&self) -> Result<bool> {
        let (session, global) = {
            let db = self.db.lock().await;
            (sum_cost(&db, Some(&self.session_id))?, sum_cost(&db, None)?)
        };
        if session >= self.settings.session_cap_usd {
            return Ok(false);
        }
        if let Some(cap) = self.settings.global_cap_usd
            && global >= cap
        {
            return Ok(false);
        }
        Ok(true)
    }

    /// Thresholds (percent of the global cap) crossed since the last call.
    /// Each threshold fires at most once per process.
    pub async fn check_threshold_alerts(&self) -> Result<Vec<ThresholdAlert>> {
        let Some(cap) = self.settings.global_cap_usd else {
            return Ok(Vec::new());
        };
        let spent = self.global_total().await?;
        let mut fired = self
            .fired_thresholds
            .lock()
            .map_err(|_| anyhow::anyhow!("threshold state poisoned"))?;
        let mut alerts = Vec::new();
        let mut thresholds = self.settings.alert_thresholds.clone();
        thresholds.sort_unstable();
        for pct in thresholds {
            if fired.contains(&pct) {
                continue;
            }
            if spent >= cap * pct as f64 / 100.0 {
                fired.insert(pct);
                warn!("Budget threshold {}% reached (${:.2} of ${:.2})", pct, spent, cap);
                alerts.push(ThresholdAlert {
                    percent: pct,
                    spent_usd: spent,
                    cap_usd: cap,
                });
            }
        }
        Ok(alerts)
    }

    async fn totals_by(&self, column: &str, session_only: bool) -> Result<Vec<(String, UsageTotals)>> {
        let db = self.db.lock().await;
        let filter = if session_only { "WHERE session_id = ?1" } else { "" };
        let sql = format!(
            "SELECT {col}, COUNT(*), SUM(input_tokens), SUM(output_tokens), SUM(cost_usd)
             FROM usage_tracking {filter} GROUP BY {col} ORDER BY SUM(cost_usd) DESC",
            col = column,
            filter = filter
        );
        let mut stmt = db.prepare(&sql)?;
        let map = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, String>(0)?,
                UsageTotals {
                    calls: row.get::<_, i64>(1)? as u64,
                    input_tokens: row.get::<_, i64>(2)? as u64,
                    output_tokens: row.get::<_, i64>(3)? as u64,
                    cost_usd: row.get(4)?,
                },
            ))
        };
        let rows = if session_only {
            stmt.query_map(params![self.session_id], map)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            stmt.query_map([], map)?.collect::<rusqlite::Result<Vec<_>>>()?
        };
        Ok(rows)
    }

    pub async fn totals_by_tier(&self) -> Result<Vec<(String, UsageTotals)>> {
        self.totals_by("tier", false).await
    }

    pub async fn totals_by_model(&self) -> Result<Vec<(String, UsageTotals)>> {
        self.totals_by("model", false).await
    }

    pub async fn totals_by_project(&self) -> Result<Vec<(String, UsageTotals)>> {
        self.totals_by("project", false).await
    }

    pub async fn session_totals_by_tier(&self) -> Result<Vec<(String, UsageTotals)>> {
        self.totals_by("tier", true).await
    }

    pub async fn summary(&self) -> Result<BudgetSummary> {
        Ok(BudgetSummary {
            session_spent: self.session_total().await?,
            session_cap: self.settings.session_cap_usd,
            global_spent: self.global_total().await?,
            global_cap: self.settings.global_cap_usd,
            can_proceed: self.can_proceed().await?,
        })
    }
}
