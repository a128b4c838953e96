use chrono::{DateTime, Utc};

/// Sentinel stored in `execute_at` for "as soon as possible".
pub const EXECUTE_NOW: &str = "now";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentType {
    OneTime,
    Recurring,
}

impl CommitmentType {
    pub fn as_str(self) -> &'static str {
        match self {
            CommitmentType::OneTime => "one_time",
            CommitmentType::Recurring => "recurring",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "one_time" => Some(CommitmentType::OneTime),
            "recurring" => Some(CommitmentType::Recurring),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentStatus {
    Active,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl CommitmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommitmentStatus::Active => "active",
            CommitmentStatus::Executing => "executing",
            CommitmentStatus::Completed => "completed",
            CommitmentStatus::Failed => "failed",
            CommitmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(CommitmentStatus::Active),
            "executing" => Some(CommitmentStatus::Executing),
            "completed" => Some(CommitmentStatus::Completed),
            "failed" => Some(CommitmentStatus::Failed),
            "cancelled" => Some(CommitmentStatus::Cancelled),
            _ => None,
        }
    }
}

/// When a one-time commitment should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteAt {
    Now,
    At(DateTime<Utc>),
}

impl ExecuteAt {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self {
            ExecuteAt::Now => true,
            ExecuteAt::At(at) => *at <= now,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        if value == EXECUTE_NOW {
            return Some(ExecuteAt::Now);
        }
        DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|d| ExecuteAt::At(d.with_timezone(&Utc)))
    }
}

impl std::fmt::Display for ExecuteAt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecuteAt::Now => f.write_str(EXECUTE_NOW),
            ExecuteAt::At(at) => f.write_str(&at.to_rfc3339()),
        }
    }
}

/// What the detector found, before it is stored.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitmentKind {
    OneTime { execute_at: ExecuteAt },
    /// Five-field cron pattern in the daemon's timezone.
    Recurring { schedule: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCommitment {
    pub kind: CommitmentKind,
    pub promise_text: String,
    pub action_description: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Commitment {
    pub id: String,
    pub commitment_type: CommitmentType,
    pub promise_text: String,
    pub action_description: String,
    pub schedule: Option<String>,
    #[serde(serialize_with = "execute_at_str")]
    pub execute_at: Option<ExecuteAt>,
    pub status: CommitmentStatus,
    pub created_at: DateTime<Utc>,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub execution_count: i64,
    pub failure_reason: Option<String>,
}

fn execute_at_str<S: serde::Serializer>(value: &Option<ExecuteAt>, s: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(at) => s.serialize_str(&at.to_string()),
        None => s.serialize_none(),
    }
}

impl Commitment {
    pub fn is_recurring(&self) -> bool {
        self.commitment_type == CommitmentType::Recurring
    }

    /// Next time this commitment is expected to run, if known.
    pub fn when(&self) -> String {
        match (self.commitment_type, &self.execute_at, &self.next_run_at) {
            (CommitmentType::OneTime, Some(at), _) => at.to_string(),
            (CommitmentType::Recurring, _, Some(next)) => next.to_rfc3339(),
            _ => "-".to_string(),
        }
    }
}
