use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mulerank_core::RunSummary;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One API-triggered run.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<RunSummary>,
}

/// In-memory task table. Lost on restart.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<RwLock<HashMap<Uuid, TaskRecord>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self) -> TaskRecord {
        let record = TaskRecord {
            task_id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
        };
        self.tasks.write().await.insert(record.task_id, record.clone());
        record
    }

    pub async fn mark_running(&self, task_id: Uuid) {
        if let Some(task) = self.tasks.write().await.get_mut(&task_id) {
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
        }
    }

    pub async fn complete(&self, task_id: Uuid, summary: RunSummary) -> Option<TaskRecord> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&task_id)?;
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        task.result = Some(summary);
        Some(task.clone())
    }

    pub async fn fail(&self, task_id: Uuid, error: String) -> Option<TaskRecord> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&task_id)?;
        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now());
        task.error = Some(error);
        Some(task.clone())
    }

    pub async fn get(&self, task_id: Uuid) -> Option<TaskRecord> {
        self.tasks.read().await.get(&task_id).cloned()
    }

    /// Newest first.
    pub async fn list(&self, limit: usize) -> Vec<TaskRecord> {
        let mut tasks = self.tasks.read().await.values().cloned().collect::<Vec<_>>();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.task_id.cmp(&a.task_id)));
        tasks.truncate(limit);
        tasks
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> RunSummary {
        let now = Utc::now();
        RunSummary {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            crawl_time: now,
            scraped_count: 1,
            new_count: 1,
            updated_count: 0,
            deactivated_count: 0,
            reactivated_count: 0,
            total_active: 1,
            duration_ms: 3,
            anomalies: Vec::new(),
        }
    }

    #[tokio::test]
    async fn task_moves_through_its_lifecycle() {
        let registry = TaskRegistry::new();
        let task = registry.create().await;
        assert_eq!(task.status, TaskStatus::Pending);

        registry.mark_running(task.task_id).await;
        let running = registry.get(task.task_id).await.expect("task");
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.started_at.is_some());

        let done = registry.complete(task.task_id, summary()).await.expect("task");
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result.map(|r| r.new_count), Some(1));
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn failures_keep_the_error_and_unknown_ids_are_ignored() {
        let registry = TaskRegistry::new();
        let task = registry.create().await;
        let failed = registry.fail(task.task_id, "extraction failed".into()).await.expect("task");
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("extraction failed"));
        assert!(registry.fail(Uuid::new_v4(), "nope".into()).await.is_none());
        assert!(registry.get(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn list_is_newest_first_and_limited() {
        let registry = TaskRegistry::new();
        let first = registry.create().await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = registry.create().await;

        let listed = registry.list(10).await;
        assert_eq!(listed[0].task_id, second.task_id);
        assert_eq!(listed[1].task_id, first.task_id);
        assert_eq!(registry.list(1).await.len(), 1);
        assert_eq!(registry.len().await, 2);
    }
}
