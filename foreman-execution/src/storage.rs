//! Task status storage

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{ExecutionResult, QueueError};
use crate::reporter::{ReporterSnapshot, TaskStatus};
use crate::task::{TaskDescriptor, TaskId};

/// Persistent record of every task's latest reporter state
///
/// A task is finished once its status is terminal.
#[async_trait]
pub trait TaskStorage: Send + Sync {
    async fn find_by_id(&self, task_id: &TaskId) -> ExecutionResult<Option<ReporterSnapshot>>;

    /// Finished or unfinished tasks, in insertion order
    async fn find_by_status(
        &self,
        finished: bool,
        offset: usize,
        limit: usize,
    ) -> ExecutionResult<Vec<ReporterSnapshot>>;

    async fn find_all(&self) -> ExecutionResult<Vec<ReporterSnapshot>>;

    async fn count(&self) -> ExecutionResult<usize>;

    /// Store the snapshot unless a newer revision is already stored
    async fn update(&self, snapshot: &ReporterSnapshot) -> ExecutionResult<()>;

    /// Record a task as waiting
    async fn insert(&self, task: &TaskDescriptor) -> ExecutionResult<()>;

    async fn cancel(&self, task: &TaskDescriptor) -> ExecutionResult<()>;

    /// Returns whether a record was removed
    async fn delete(&self, task_id: &TaskId) -> ExecutionResult<bool>;
}

#[derive(Default)]
struct Records {
    by_id: HashMap<TaskId, ReporterSnapshot>,
    order: Vec<TaskId>,
}

impl Records {
    fn upsert(&mut self, snapshot: ReporterSnapshot) {
        let task_id = snapshot.task.id.clone();
        if self.by_id.insert(task_id.clone(), snapshot).is_none() {
            self.order.push(task_id);
        }
    }

    fn ordered(&self) -> impl Iterator<Item = &ReporterSnapshot> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }
}

/// Storage kept in process memory
#[derive(Default)]
pub struct InMemoryTaskStorage {
    records: Mutex<Records>,
}

impl InMemoryTaskStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TaskStorage for InMemoryTaskStorage {
    async fn find_by_id(&self, task_id: &TaskId) -> ExecutionResult<Option<ReporterSnapshot>> {
        Ok(self.records().by_id.get(task_id).cloned())
    }

    async fn find_by_status(
        &self,
        finished: bool,
        offset: usize,
        limit: usize,
    ) -> ExecutionResult<Vec<ReporterSnapshot>> {
        Ok(self
            .records()
            .ordered()
            .filter(|snapshot| snapshot.status.is_terminal() == finished)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_all(&self) -> ExecutionResult<Vec<ReporterSnapshot>> {
        Ok(self.records().ordered().cloned().collect())
    }

    async fn count(&self) -> ExecutionResult<usize> {
        Ok(self.records().by_id.len())
    }

    async fn update(&self, snapshot: &ReporterSnapshot) -> ExecutionResult<()> {
        let mut records = self.records();
        if let Some(stored) = records.by_id.get(&snapshot.task.id) {
            if stored.revision > snapshot.revision {
                return Ok(());
            }
        }
        records.upsert(snapshot.clone());
        Ok(())
    }

    async fn insert(&self, task: &TaskDescriptor) -> ExecutionResult<()> {
        self.records().upsert(ReporterSnapshot::waiting(task.clone()));
        Ok(())
    }

    async fn cancel(&self, task: &TaskDescriptor) -> ExecutionResult<()> {
        let mut records = self.records();
        let snapshot = records
            .by_id
            .get_mut(&task.id)
            .ok_or_else(|| QueueError::NotFound(task.id.clone()))?;
        snapshot.status = TaskStatus::Cancelled;
        snapshot.revision += 1;
        Ok(())
    }

    async fn delete(&self, task_id: &TaskId) -> ExecutionResult<bool> {
        let mut records = self.records();
        let removed = records.by_id.remove(task_id).is_some();
        if removed {
            records.order.retain(|id| id != task_id);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::reporter::ProgressReporter;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_then_update_lifecycle() {
        let storage = InMemoryTaskStorage::new();
        let task = fixtures::sleep("t-1", 10, json!(1));

        storage.insert(&task).await.unwrap();
        let stored = storage.find_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Waiting);

        let reporter = ProgressReporter::new(task.clone());
        reporter.set_message("halfway");
        storage.update(&reporter.snapshot()).await.unwrap();
        reporter.finish_task(json!(1));
        let finished = reporter.snapshot();
        storage.update(&finished).await.unwrap();

        // A stale snapshot does not overwrite the finished one
        let mut stale = finished.clone();
        stale.status = TaskStatus::Processing;
        stale.revision = 1;
        storage.update(&stale).await.unwrap();

        let stored = storage.find_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result, Some(json!(1)));
        assert_eq!(storage.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_find_by_status_pages_in_insertion_order() {
        let storage = InMemoryTaskStorage::new();
        for index in 0..5 {
            storage
                .insert(&fixtures::sleep(&format!("t-{}", index), 10, json!(index)))
                .await
                .unwrap();
        }
        storage.cancel(&fixtures::sleep("t-1", 10, json!(1))).await.unwrap();

        let unfinished = storage.find_by_status(false, 1, 2).await.unwrap();
        let ids: Vec<&str> = unfinished.iter().map(|s| s.task.id.as_str()).collect();
        assert_eq!(ids, vec!["t-2", "t-3"]);

        let finished = storage.find_by_status(true, 0, 10).await.unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_and_delete_missing_task() {
        let storage = InMemoryTaskStorage::new();
        let task = fixtures::sleep("ghost", 10, json!(null));

        let err = storage.cancel(&task).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        assert!(!storage.delete(&task.id).await.unwrap());

        storage.insert(&task).await.unwrap();
        assert!(storage.delete(&task.id).await.unwrap());
        assert!(storage.find_all().await.unwrap().is_empty());
    }
}
