//! Task registry boundary and its in-process implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::task::{Task, TaskError, TaskId, TaskResult, TaskState};
use crate::error::{PipelineError, Result};

/// Worker-side mutation applied atomically with a state transition.
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub state: TaskState,
    pub result: Option<TaskResult>,
    pub error: Option<TaskError>,
    pub progress: Option<f64>,
    pub retries_left: Option<u32>,
    pub max_retries: Option<u32>,
}

impl TaskUpdate {
    pub fn state(state: TaskState) -> Self {
        Self {
            state,
            result: None,
            error: None,
            progress: None,
            retries_left: None,
            max_retries: None,
        }
    }

    pub fn done(value: serde_json::Value) -> Self {
        Self {
            result: Some(TaskResult { value }),
            progress: Some(1.0),
            ..Self::state(TaskState::Done)
        }
    }

    pub fn failed(error: TaskError) -> Self {
        Self {
            error: Some(error),
            ..Self::state(TaskState::Error)
        }
    }

    pub fn with_retries_left(mut self, retries_left: Option<u32>) -> Self {
        self.retries_left = retries_left;
        self
    }

    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Registry of submitted tasks.
#[async_trait]
pub trait TaskRegistry: Send + Sync {
    /// Register a new task in `CREATED` and return its id.
    ///
    /// When `id` is `None` an id of the form `<name>-<uuid>` is generated.
    async fn create_task(
        &self,
        name: &str,
        args: Option<serde_json::Value>,
        id: Option<TaskId>,
        group: Option<&str>,
    ) -> Result<TaskId>;

    async fn get_task(&self, id: &str) -> Result<Task>;

    async fn list_tasks(&self) -> Result<Vec<Task>>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// Apply a worker-side update, enforcing forward-only transitions.
    async fn transition(&self, id: &str, update: TaskUpdate) -> Result<Task>;

    /// Record the latest progress rate of a task still in flight.
    ///
    /// Ignored once the task is terminal.
    async fn set_progress(&self, id: &str, progress: f64) -> Result<()>;

    async fn get_task_state(&self, id: &str) -> Result<TaskState> {
        Ok(self.get_task(id).await?.state)
    }

    async fn get_task_result(&self, id: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.get_task(id).await?.result.map(|r| r.value))
    }

    /// Error payload of a task in `ERROR`.
    async fn get_task_error(&self, id: &str) -> Result<TaskError> {
        let task = self.get_task(id).await?;
        match (task.state, task.error) {
            (TaskState::Error, Some(error)) => Ok(error),
            (state, _) => Err(PipelineError::InvalidInput(format!(
                "can't find error for task {} in state {}",
                id, state
            ))),
        }
    }

    async fn delete_all(&self) -> Result<()> {
        for task in self.list_tasks().await? {
            self.delete(&task.id).await?;
        }
        Ok(())
    }
}

/// In-memory registry, keyed by task id, grouped by optional task group.
#[derive(Default)]
pub struct InMemoryTaskRegistry {
    tasks: RwLock<HashMap<TaskId, Task>>,
    groups: RwLock<HashMap<TaskId, String>>,
}

impl InMemoryTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group the task was submitted under, if any.
    pub async fn group_of(&self, id: &str) -> Option<String> {
        self.groups.read().await.get(id).cloned()
    }
}

#[async_trait]
impl TaskRegistry for InMemoryTaskRegistry {
    async fn create_task(
        &self,
        name: &str,
        args: Option<serde_json::Value>,
        id: Option<TaskId>,
        group: Option<&str>,
    ) -> Result<TaskId> {
        let id = id.unwrap_or_else(|| Task::generate_id(name));
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&id) {
            return Err(PipelineError::InvalidInput(format!(
                "task {} already exists",
                id
            )));
        }
        tasks.insert(id.clone(), Task::new(id.clone(), name, args));
        drop(tasks);

        if let Some(group) = group {
            self.groups
                .write()
                .await
                .insert(id.clone(), group.to_string());
        }
        tracing::debug!(task_id = %id, "Created task");
        Ok(id)
    }

    async fn get_task(&self, id: &str) -> Result<Task> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::unknown_task(id))
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.tasks
            .write()
            .await
            .remove(id)
            .ok_or_else(|| PipelineError::unknown_task(id))?;
        self.groups.write().await.remove(id);
        Ok(())
    }

    async fn transition(&self, id: &str, update: TaskUpdate) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| PipelineError::unknown_task(id))?;
        task.transition(update.state)?;
        if let Some(result) = update.result {
            task.result = Some(result);
        }
        if let Some(error) = update.error {
            task.error = Some(error);
        }
        if let Some(progress) = update.progress {
            task.progress = Some(progress);
        }
        if let Some(retries_left) = update.retries_left {
            task.retries_left = Some(retries_left);
        }
        if let Some(max_retries) = update.max_retries {
            task.max_retries = Some(max_retries);
        }
        Ok(task.clone())
    }

    async fn set_progress(&self, id: &str, progress: f64) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| PipelineError::unknown_task(id))?;
        if !task.state.is_terminal() {
            task.progress = Some(progress);
        }
        Ok(())
    }
}

/// Shared registry handle.
pub type SharedTaskRegistry = Arc<dyn TaskRegistry>;
