use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::models::{Submission, Task, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound,
    /// A row for this task id already exists.
    Duplicate,
    /// `update_task` refuses to write `Pending` over an existing row.
    StatusNotSet,
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "task not found"),
            StoreError::Duplicate => write!(f, "task already exists"),
            StoreError::StatusNotSet => write!(f, "task status is not set"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Persisted shape of a task row (`task_infos`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: Uuid,
    pub status: u8,
    pub output: Option<String>,
    pub err_output: Option<String>,
    pub memory: Option<i64>,
    pub time: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRow {
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_code(self.status).unwrap_or(TaskStatus::Pending)
    }
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    tasks: HashMap<Uuid, TaskRow>,
    submissions: Vec<Submission>,
}

/// Submission and task persistence. All rows live behind one lock so that
/// `transaction` can stage changes and commit or discard them atomically.
/// Terminal task rows are optionally journaled to a JSONL file, one line
/// per finished task.
pub struct Store {
    state: Mutex<StoreState>,
    journal_path: Option<PathBuf>,
    journal_lock: Mutex<()>,
}

impl Store {
    pub fn new(journal_path: Option<PathBuf>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            journal_path,
            journal_lock: Mutex::new(()),
        }
    }

    /// Runs `f` against a staged copy of the store; either every write in
    /// the closure commits or none does.
    pub async fn transaction<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StoreTx<'_>) -> Result<(), StoreError>,
    {
        let mut state = self.state.lock().await;
        let mut staged = state.clone();
        let mut tx = StoreTx { state: &mut staged };
        f(&mut tx)?;
        *state = staged;
        Ok(())
    }

    pub async fn create_submission(&self, submission: Submission) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.submissions.push(submission);
        Ok(())
    }

    pub async fn submissions_by_submit_id(&self, submit_id: &str) -> Vec<Submission> {
        let state = self.state.lock().await;
        state
            .submissions
            .iter()
            .filter(|row| row.submit_id == submit_id)
            .cloned()
            .collect()
    }

    pub async fn submissions_by_task_id(&self, task_id: Uuid) -> Vec<Submission> {
        let state = self.state.lock().await;
        state
            .submissions
            .iter()
            .filter(|row| row.task_id == task_id)
            .cloned()
            .collect()
    }

    pub async fn create_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        insert_task(&mut state, task)
    }

    /// Writes the terminal status and outputs. Rejects `Pending` so a stuck
    /// retry can never clear the output fields of a finished task.
    pub async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        if task.status == TaskStatus::Pending {
            return Err(StoreError::StatusNotSet);
        }
        let snapshot = {
            let mut state = self.state.lock().await;
            let row = state.tasks.get_mut(&task.id).ok_or(StoreError::NotFound)?;
            row.status = task.status.code();
            row.output = task.stdout.clone();
            row.err_output = task.stderr.clone();
            if task.time_ms.is_some() {
                row.time = task.time_ms;
            }
            if task.memory_bytes.is_some() {
                row.memory = task.memory_bytes;
            }
            row.updated_at = Utc::now();
            row.clone()
        };
        self.journal(&snapshot).await;
        Ok(())
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<TaskRow, StoreError> {
        let state = self.state.lock().await;
        state.tasks.get(&task_id).cloned().ok_or(StoreError::NotFound)
    }

    /// True when any submission row for `task_id` carries `app_id`; no rows
    /// at all means the task is unknown.
    pub async fn task_belongs_to_app(&self, task_id: Uuid, app_id: u64) -> Result<bool, StoreError> {
        let rows = self.submissions_by_task_id(task_id).await;
        if rows.is_empty() {
            return Err(StoreError::NotFound);
        }
        Ok(rows.iter().any(|row| row.app_id == app_id))
    }

    async fn journal(&self, row: &TaskRow) {
        let Some(path) = &self.journal_path else {
            return;
        };
        let _guard = self.journal_lock.lock().await;
        let line = match serde_json::to_string(row) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "failed to serialize task row for journal");
                return;
            }
        };
        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).append(true);
        match options.open(path).await {
            Ok(mut file) => {
                if let Err(err) = file.write_all(line.as_bytes()).await {
                    warn!(error = %err, "failed to append task journal");
                    return;
                }
                let _ = file.write_all(b"\n").await;
            }
            Err(err) => warn!(error = %err, path = %path.display(), "failed to open task journal"),
        }
    }
}

/// Write handle inside a [`Store::transaction`] closure.
pub struct StoreTx<'a> {
    state: &'a mut StoreState,
}

impl StoreTx<'_> {
    pub fn create_submission(&mut self, submission: Submission) -> Result<(), StoreError> {
        self.state.submissions.push(submission);
        Ok(())
    }

    pub fn create_task(&mut self, task: &Task) -> Result<(), StoreError> {
        insert_task(self.state, task)
    }
}

fn insert_task(state: &mut StoreState, task: &Task) -> Result<(), StoreError> {
    if state.tasks.contains_key(&task.id) {
        return Err(StoreError::Duplicate);
    }
    let now = Utc::now();
    state.tasks.insert(
        task.id,
        TaskRow {
            id: task.id,
            status: TaskStatus::Pending.code(),
            output: None,
            err_output: None,
            memory: None,
            time: None,
            created_at: now,
            updated_at: now,
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::language::Language;

    fn sample_task() -> Task {
        Task::new("s1".into(), 42, Language::Python, "print(1)".into())
    }

    #[tokio::test]
    async fn created_task_starts_pending_without_output() {
        let store = Store::new(None);
        let task = sample_task();
        store.create_task(&task).await.unwrap();

        let row = store.get_task(task.id).await.unwrap();
        assert_eq!(row.status(), TaskStatus::Pending);
        assert!(row.output.is_none());
        assert!(row.err_output.is_none());
    }

    #[tokio::test]
    async fn update_rejects_pending_status() {
        let store = Store::new(None);
        let task = sample_task();
        store.create_task(&task).await.unwrap();

        assert_eq!(
            store.update_task(&task).await,
            Err(StoreError::StatusNotSet)
        );
    }

    #[tokio::test]
    async fn terminal_update_writes_streams_separately() {
        let store = Store::new(None);
        let mut task = sample_task();
        store.create_task(&task).await.unwrap();

        task.status = TaskStatus::Success;
        task.stdout = Some("out".into());
        task.stderr = Some("err".into());
        store.update_task(&task).await.unwrap();

        let row = store.get_task(task.id).await.unwrap();
        assert_eq!(row.status(), TaskStatus::Success);
        assert_eq!(row.output.as_deref(), Some("out"));
        assert_eq!(row.err_output.as_deref(), Some("err"));
    }

    #[tokio::test]
    async fn missing_task_is_not_found() {
        let store = Store::new(None);
        assert_eq!(
            store.get_task(Uuid::new_v4()).await,
            Err(StoreError::NotFound)
        );
    }

    #[tokio::test]
    async fn duplicate_task_id_is_rejected() {
        let store = Store::new(None);
        let task = sample_task();
        store.create_task(&task).await.unwrap();
        assert_eq!(store.create_task(&task).await, Err(StoreError::Duplicate));
    }

    #[tokio::test]
    async fn failed_transaction_commits_nothing() {
        let store = Store::new(None);
        let task = sample_task();

        let result = store
            .transaction(|tx| {
                tx.create_submission(Submission::for_task(&task))?;
                tx.create_task(&task)?;
                Err(StoreError::Duplicate)
            })
            .await;

        assert!(result.is_err());
        assert!(store.submissions_by_submit_id("s1").await.is_empty());
        assert_eq!(store.get_task(task.id).await, Err(StoreError::NotFound));
    }

    #[tokio::test]
    async fn transaction_commits_both_rows() {
        let store = Store::new(None);
        let task = sample_task();

        store
            .transaction(|tx| {
                tx.create_submission(Submission::for_task(&task))?;
                tx.create_task(&task)
            })
            .await
            .unwrap();

        assert_eq!(store.submissions_by_submit_id("s1").await.len(), 1);
        assert!(store.get_task(task.id).await.is_ok());
    }

    #[tokio::test]
    async fn ownership_check_matches_app() {
        let store = Store::new(None);
        let task = sample_task();
        store
            .create_submission(Submission::for_task(&task))
            .await
            .unwrap();

        assert!(store.task_belongs_to_app(task.id, 42).await.unwrap());
        assert!(!store.task_belongs_to_app(task.id, 7).await.unwrap());
        assert_eq!(
            store.task_belongs_to_app(Uuid::new_v4(), 42).await,
            Err(StoreError::NotFound)
        );
    }

    #[tokio::test]
    async fn journal_appends_terminal_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.jsonl");
        let store = Store::new(Some(path.clone()));

        let mut task = sample_task();
        store.create_task(&task).await.unwrap();
        task.status = TaskStatus::Failed;
        task.stderr = Some("boom".into());
        store.update_task(&task).await.unwrap();

        let contents = std::fs::read_to_string(path).unwrap();
        let row: TaskRow = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(row.id, task.id);
        assert_eq!(row.status(), TaskStatus::Failed);
        assert_eq!(row.err_output.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn time_and_memory_are_optional() {
        let store = Store::new(None);
        let mut task = sample_task();
        store.create_task(&task).await.unwrap();

        task.status = TaskStatus::Success;
        task.stdout = Some(String::new());
        task.time_ms = Some(12);
        task.memory_bytes = Some(1024);
        store.update_task(&task).await.unwrap();

        let row = store.get_task(task.id).await.unwrap();
        assert_eq!(row.time, Some(12));
        assert_eq!(row.memory, Some(1024));
    }
}
