use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{StatusUpdate, TaskRepository};
use crate::error::{Result, TaskCoreError};
use crate::model::{Task, TaskStatus};

/// In-memory repository backed by a lock-guarded map, grounded on the
/// running-task registry pattern: a single `RwLock<HashMap<..>>` gives each
/// operation atomicity for free since the whole map is locked for the
/// duration of the mutation.
#[derive(Clone, Default)]
pub struct InMemoryTaskRepository {
    tasks: Arc<RwLock<HashMap<String, Task>>>,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn create(&self, task: Task) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(TaskCoreError::DuplicateId(task.id));
        }
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn update_status(
        &self,
        id: &str,
        new_status: TaskStatus,
        update: StatusUpdate,
    ) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(id).ok_or_else(|| TaskCoreError::NotFound(id.to_string()))?;
        task.status = new_status;
        if new_status.is_terminal() {
            task.finished_at = Some(Utc::now());
        }
        if let Some(summary) = update.result_summary {
            task.result_summary = Some(summary);
        }
        if let Some(err) = update.error_message {
            task.error_message = Some(err);
        }
        if let Some(handle) = update.continuation_handle {
            task.continuation_handle = Some(handle);
        }
        if let Some(commits) = update.commits {
            task.commits = commits;
        }
        task.last_activity_at = Utc::now();
        Ok(())
    }

    async fn update_progress(
        &self,
        id: &str,
        cost_delta: f64,
        last_output: Option<&str>,
    ) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(id).ok_or_else(|| TaskCoreError::NotFound(id.to_string()))?;
        task.total_cost += cost_delta;
        task.total_turns += 1;
        if let Some(output) = last_output {
            task.last_output = Some(output.to_string());
        }
        task.last_activity_at = Utc::now();
        Ok(())
    }

    async fn get_running_for_project(&self, working_dir: &str) -> Result<Option<Task>> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .find(|t| t.status == TaskStatus::Running && t.working_dir == working_dir)
            .cloned())
    }

    async fn get_all_running(&self) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .cloned()
            .collect())
    }

    async fn count_running(&self) -> Result<usize> {
        let tasks = self.tasks.read().await;
        Ok(tasks.values().filter(|t| t.status == TaskStatus::Running).count())
    }

    async fn get_last_finished_for_project(&self, working_dir: &str) -> Result<Option<Task>> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| {
                t.working_dir == working_dir
                    && matches!(t.status, TaskStatus::Completed | TaskStatus::Failed)
            })
            .max_by_key(|t| t.finished_at)
            .cloned())
    }
}
