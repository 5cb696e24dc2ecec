use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use crate::metrics::MetricsRegistry;
use crate::models::{Submission, Task, TaskStatus};
use crate::sandbox::language::Language;
use crate::sandbox::CodeRunner;
use crate::singleflight;
use crate::store::{Store, StoreError, TaskRow};

/// Domain-level sentinel errors. `Clone` so coalesced duplicate
/// submissions can all observe the same outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    UnsupportedLanguage,
    TaskLimitReached,
    NotFound,
    WorkerSaturated,
    Storage(String),
}

impl Display for TaskError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::UnsupportedLanguage => write!(f, "unsupported language"),
            TaskError::TaskLimitReached => write!(f, "user task limit reached"),
            TaskError::NotFound => write!(f, "task not found"),
            TaskError::WorkerSaturated => write!(f, "worker pool is saturated"),
            TaskError::Storage(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for TaskError {}

impl From<StoreError> for TaskError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound => TaskError::NotFound,
            other => TaskError::Storage(other.to_string()),
        }
    }
}

/// Per-tenant in-flight cap. The map entry disappears when a tenant's
/// count returns to zero.
struct TenantCounter {
    slots: StdMutex<HashMap<u64, usize>>,
    max_per_tenant: usize,
}

impl TenantCounter {
    fn new(max_per_tenant: usize) -> Self {
        Self {
            slots: StdMutex::new(HashMap::new()),
            max_per_tenant,
        }
    }

    fn acquire(&self, app_id: u64) -> bool {
        let mut slots = self.slots.lock().expect("tenant counter lock poisoned");
        let count = slots.get(&app_id).copied().unwrap_or(0);
        if count >= self.max_per_tenant {
            return false;
        }
        slots.insert(app_id, count + 1);
        true
    }

    fn release(&self, app_id: u64) {
        let mut slots = self.slots.lock().expect("tenant counter lock poisoned");
        if let Some(count) = slots.get_mut(&app_id) {
            if *count <= 1 {
                slots.remove(&app_id);
            } else {
                *count -= 1;
            }
        }
    }

    #[cfg(test)]
    fn in_flight(&self, app_id: u64) -> usize {
        let slots = self.slots.lock().expect("tenant counter lock poisoned");
        slots.get(&app_id).copied().unwrap_or(0)
    }
}

struct ExecutionJob {
    filename: String,
    task: Task,
}

/// Submission pipeline: admission, transactional persistence, dispatch to
/// the bounded worker pool, and the terminal status transition.
pub struct TaskService {
    store: Arc<Store>,
    jobs: Sender<ExecutionJob>,
    tenants: Arc<TenantCounter>,
    metrics: Arc<MetricsRegistry>,
    dedup: singleflight::Group<Result<Uuid, TaskError>>,
}

impl TaskService {
    pub fn new(
        pool_num: usize,
        max_task_per_user: usize,
        store: Arc<Store>,
        runner: Arc<dyn CodeRunner>,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        let workers = pool_num.max(1);
        let (sender, receiver) = mpsc::channel(workers);
        let receiver = Arc::new(Mutex::new(receiver));
        let tenants = Arc::new(TenantCounter::new(max_task_per_user));

        for worker_id in 0..workers {
            tokio::spawn(worker_loop(
                worker_id,
                receiver.clone(),
                store.clone(),
                runner.clone(),
                tenants.clone(),
                metrics.clone(),
            ));
        }

        Arc::new(Self {
            store,
            jobs: sender,
            tenants,
            metrics,
            dedup: singleflight::Group::new(),
        })
    }

    /// Runs the submission pipeline for one task and returns its id. The
    /// tenant slot acquired here is released exactly once: on any failure
    /// path below, or at worker exit.
    pub async fn submit(&self, mut task: Task) -> Result<Uuid, TaskError> {
        task.id = Uuid::new_v4();
        let filename = task.file_name();
        if Language::from_file_name(&filename).is_none() {
            return Err(TaskError::UnsupportedLanguage);
        }

        let app_id = task.app_id;
        if !self.tenants.acquire(app_id) {
            return Err(TaskError::TaskLimitReached);
        }

        let submission = Submission::for_task(&task);
        if let Err(err) = self
            .store
            .transaction(|tx| {
                tx.create_submission(submission)?;
                tx.create_task(&task)
            })
            .await
        {
            self.tenants.release(app_id);
            error!(task_id = %task.id, error = %err, "failed to persist submission");
            return Err(err.into());
        }

        let task_id = task.id;
        let job = ExecutionJob { filename, task };
        if self.jobs.try_send(job).is_err() {
            // Slot keyed by app id, mirroring the acquire above.
            self.tenants.release(app_id);
            self.metrics.task_rejected();
            return Err(TaskError::WorkerSaturated);
        }

        self.metrics.task_submitted();
        info!(task_id = %task_id, app_id, "task dispatched");
        Ok(task_id)
    }

    /// Submission with duplicate coalescing: concurrent calls sharing
    /// `(app_id, submit_id)` run the pipeline once and share its outcome.
    pub async fn submit_deduped(
        &self,
        submit_id: &str,
        app_id: u64,
        language: Language,
        code: String,
    ) -> Result<Uuid, TaskError> {
        let key = format!("{app_id}:{submit_id}");
        self.dedup
            .run(&key, || async {
                let task = Task::new(submit_id.to_string(), app_id, language, code);
                self.submit(task).await
            })
            .await
    }

    pub async fn get_result(&self, task_id: Uuid) -> Result<TaskRow, TaskError> {
        Ok(self.store.get_task(task_id).await?)
    }

    pub async fn task_belongs_to_app(
        &self,
        task_id: Uuid,
        app_id: u64,
    ) -> Result<bool, TaskError> {
        Ok(self.store.task_belongs_to_app(task_id, app_id).await?)
    }

    pub async fn submissions_by_task_id(&self, task_id: Uuid) -> Vec<Submission> {
        self.store.submissions_by_task_id(task_id).await
    }

    #[cfg(test)]
    fn in_flight(&self, app_id: u64) -> usize {
        self.tenants.in_flight(app_id)
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<Mutex<Receiver<ExecutionJob>>>,
    store: Arc<Store>,
    runner: Arc<dyn CodeRunner>,
    tenants: Arc<TenantCounter>,
    metrics: Arc<MetricsRegistry>,
) {
    loop {
        let job = {
            let mut locked = receiver.lock().await;
            locked.recv().await
        };
        let Some(ExecutionJob { filename, mut task }) = job else {
            info!(worker_id, "job queue closed, worker exiting");
            break;
        };

        info!(worker_id, task_id = %task.id, language = %task.language, "starting execution");
        match runner.exec(task.language, &filename, &task.code).await {
            Ok(output) => {
                task.status = if output.succeeded() {
                    TaskStatus::Success
                } else {
                    TaskStatus::Failed
                };
                task.stdout = Some(output.stdout);
                task.stderr = Some(output.stderr);
            }
            Err(err) => {
                task.status = TaskStatus::Failed;
                task.stderr = Some(err.to_string());
            }
        }

        if task.status == TaskStatus::Success {
            metrics.task_completed();
        } else {
            metrics.task_failed();
        }
        if let Err(err) = store.update_task(&task).await {
            error!(task_id = %task.id, error = %err, "failed to update task result");
        }
        tenants.release(task.app_id);
    }
}
