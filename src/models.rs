use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sandbox::language::Language;

/// Task lifecycle. A task is created `Pending` and transitions exactly once
/// to `Success` or `Failed`; output fields are written only during that
/// terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn code(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Success => 1,
            TaskStatus::Failed => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TaskStatus::Pending),
            1 => Some(TaskStatus::Success),
            2 => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Success => "Success",
            TaskStatus::Failed => "Failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub submit_id: String,
    pub app_id: u64,
    pub language: Language,
    pub code: String,
    pub status: TaskStatus,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub time_ms: Option<i64>,
    pub memory_bytes: Option<i64>,
}

impl Task {
    pub fn new(submit_id: String, app_id: u64, language: Language, code: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            submit_id,
            app_id,
            language,
            code,
            status: TaskStatus::Pending,
            stdout: None,
            stderr: None,
            time_ms: None,
            memory_bytes: None,
        }
    }

    /// Source file name as it appears inside the container.
    pub fn file_name(&self) -> String {
        format!("{}{}", self.id, self.language.file_suffix())
    }
}

/// One client submission attempt. Written in the same transaction as the
/// initial task row; `(app_id, submit_id)` is the idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub submit_id: String,
    pub task_id: Uuid,
    pub app_id: u64,
    pub language: Language,
    pub code: String,
}

impl Submission {
    pub fn for_task(task: &Task) -> Self {
        Self {
            submit_id: task.submit_id.clone(),
            task_id: task.id,
            app_id: task.app_id,
            language: task.language,
            code: task.code.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitTaskRequest {
    pub language: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitTaskResponse {
    pub task_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskResultResponse {
    pub task_id: Uuid,
    pub language: String,
    pub status: &'static str,
    pub stdout: String,
    pub stderr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for status in [TaskStatus::Pending, TaskStatus::Success, TaskStatus::Failed] {
            assert_eq!(TaskStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(TaskStatus::from_code(3), None);
    }

    #[test]
    fn file_name_uses_language_suffix() {
        let task = Task::new("s1".into(), 42, Language::Python, "print(1)".into());
        assert_eq!(task.file_name(), format!("{}.py", task.id));
    }
}
