use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Commitment,
    Research,
    Coding,
    General,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Commitment => "commitment",
            TaskType::Research => "research",
            TaskType::Coding => "coding",
            TaskType::General => "general",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "commitment" => Some(TaskType::Commitment),
            "research" => Some(TaskType::Research),
            "coding" => Some(TaskType::Coding),
            "general" => Some(TaskType::General),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Blocked,
    Done,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Blocked,
        TaskStatus::Done,
        TaskStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "blocked" => Some(TaskStatus::Blocked),
            "done" => Some(TaskStatus::Done),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// Directed edges of the task state machine. Self-loops are not transitions.
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    match from {
        TaskStatus::Queued => matches!(to, TaskStatus::Running),
        TaskStatus::Running => matches!(
            to,
            TaskStatus::Blocked | TaskStatus::Done | TaskStatus::Failed
        ),
        TaskStatus::Blocked => matches!(
            to,
            TaskStatus::Queued | TaskStatus::Running | TaskStatus::Done | TaskStatus::Failed
        ),
        TaskStatus::Failed => matches!(to, TaskStatus::Queued),
        TaskStatus::Done => false,
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Artifact {
    #[serde(rename = "type")]
    pub kind: String,
    pub label: String,
    pub value: String,
}

impl Artifact {
    pub fn new(kind: &str, label: &str, value: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            label: label.to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: i64,
    pub parent_task_id: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub block_reason: Option<String>,
    pub checkpoint_data: Map<String, Value>,
    pub artifacts: Vec<Artifact>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_count: i64,
    pub last_error: Option<String>,
}

impl Task {
    /// The error text that is authoritative for the current status.
    pub fn status_reason(&self) -> Option<&str> {
        match self.status {
            TaskStatus::Blocked => self.block_reason.as_deref(),
            TaskStatus::Failed => self.last_error.as_deref(),
            _ => None,
        }
    }
}

/// Fields supplied by a submitter (chat command, CLI, commitment executor).
#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub task_type: TaskType,
    pub priority: i64,
    pub parent_task_id: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new(title: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            title: title.into(),
            task_type,
            priority: 0,
            parent_task_id: None,
            deadline: None,
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn parent(mut self, parent_task_id: &str) -> Self {
        self.parent_task_id = Some(parent_task_id.to_string());
        self
    }

    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}
