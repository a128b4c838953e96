use anyhow::Result;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

/// Shared handle to the daemon's single sqlite database. Every component
/// receives a clone of the connection handle at construction; the mutex makes
/// the database the single writer that the guarded status updates rely on.
pub struct Datastore {
    db: Arc<Mutex<Connection>>,
    data_dir: PathBuf,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        task_type TEXT NOT NULL,
        status TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        parent_task_id TEXT,
        deadline TEXT,
        block_reason TEXT,
        checkpoint_data TEXT NOT NULL DEFAULT '{}',
        artifacts TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        execution_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status_priority ON tasks(status, priority)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_task_id)",
    "CREATE TABLE IF NOT EXISTS commitments (
        id TEXT PRIMARY KEY,
        commitment_type TEXT NOT NULL,
        promise_text TEXT NOT NULL,
        action_description TEXT NOT NULL,
        schedule TEXT,
        execute_at TEXT,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        last_executed_at TEXT,
        next_run_at TEXT,
        execution_count INTEGER NOT NULL DEFAULT 0,
        failure_reason TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_commitments_status ON commitments(status)",
    "CREATE TABLE IF NOT EXISTS blocker_resolutions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        symptom TEXT NOT NULL,
        blocker_type TEXT NOT NULL,
        original_tool TEXT NOT NULL,
        original_error TEXT NOT NULL,
        resolution_tool TEXT NOT NULL,
        resolution_args TEXT NOT NULL DEFAULT '{}',
        success INTEGER NOT NULL,
        task_id TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_blockers_symptom ON blocker_resolutions(symptom, id)",
    "CREATE INDEX IF NOT EXISTS idx_blockers_tool ON blocker_resolutions(original_tool, id)",
    "CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        project TEXT NOT NULL,
        started_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS usage_tracking (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        project TEXT NOT NULL,
        tier TEXT NOT NULL,
        provider TEXT NOT NULL,
        model TEXT NOT NULL,
        input_tokens INTEGER NOT NULL,
        output_tokens INTEGER NOT NULL,
        cost_usd REAL NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_usage_session ON usage_tracking(session_id)",
];

fn apply_schema(db: &Connection) -> Result<()> {
    for statement in SCHEMA {
        db.execute(statement, [])?;
    }
    Ok(())
}

impl Datastore {
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir).await?;
        }

        let db_path = data_dir.join("nightshift.db");
        let db = Connection::open(&db_path)?;
        apply_schema(&db)?;
        info!("Datastore opened at {:?}", db_path);

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            data_dir,
        })
    }

    pub fn get_db(&self) -> Arc<Mutex<Connection>> {
        self.db.clone()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

/// In-memory datastore for tests. Avoids filesystem side-effects.
#[cfg(test)]
pub fn test_datastore() -> Datastore {
    let db = Connection::open_in_memory().expect("open in-memory db");
    apply_schema(&db).expect("apply schema");
    Datastore {
        db: Arc::new(Mutex::new(db)),
        data_dir: std::env::temp_dir(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_all_tables() {
        let dir = tempfile::tempdir().unwrap();
        let store = Datastore::open(dir.path()).await.unwrap();
        let db = store.get_db();
        let db = db.lock().await;
        for table in [
            "tasks",
            "commitments",
            "blocker_resolutions",
            "usage_tracking",
            "sessions",
        ] {
            let count: i64 = db
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {}", table);
        }
    }

    #[tokio::test]
    async fn reopening_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        drop(Datastore::open(dir.path()).await.unwrap());
        let store = Datastore::open(dir.path()).await.unwrap();
        assert!(store.data_dir().join("nightshift.db").exists());
    }
}
