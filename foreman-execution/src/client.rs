//! Submitter-side facade over a task queue and its storage

use std::sync::Arc;

use crate::error::{ExecutionError, ExecutionResult};
use crate::queue::TaskQueue;
use crate::reporter::ReporterSnapshot;
use crate::storage::TaskStorage;
use crate::task::{TaskDescriptor, TaskId};

/// Hands tasks to a queue served by a task manager elsewhere
///
/// Status lookups read the storage the manager writes to and need one to be
/// configured.
#[derive(Clone)]
pub struct Client {
    queue: Arc<dyn TaskQueue>,
    storage: Option<Arc<dyn TaskStorage>>,
}

impl Client {
    pub fn new(queue: Arc<dyn TaskQueue>, storage: Option<Arc<dyn TaskStorage>>) -> Self {
        Self { queue, storage }
    }

    /// Resolves once the task is queued
    pub async fn submit_task(&self, task: TaskDescriptor) -> ExecutionResult<()> {
        Ok(self.queue.enqueue(task).await?)
    }

    /// Tasks that already left the queue cannot be cancelled
    pub async fn cancel_task(&self, task_id: &TaskId) -> ExecutionResult<()> {
        Ok(self.queue.cancel(task_id).await?)
    }

    pub async fn check_task_status(&self, task_id: &TaskId) -> ExecutionResult<Option<ReporterSnapshot>> {
        self.storage()?.find_by_id(task_id).await
    }

    pub async fn check_all_tasks_status(&self) -> ExecutionResult<Vec<ReporterSnapshot>> {
        self.storage()?.find_all().await
    }

    fn storage(&self) -> ExecutionResult<&Arc<dyn TaskStorage>> {
        self.storage.as_ref().ok_or(ExecutionError::NoStorage)
    }
}
