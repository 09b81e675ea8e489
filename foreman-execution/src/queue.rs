//! Task queue contract and the in-memory queue

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::QueueError;
use crate::storage::TaskStorage;
use crate::task::{TaskDescriptor, TaskId};

/// Callback fired when a task becomes available for dequeueing
pub type AvailableCallback = Arc<dyn Fn() + Send + Sync>;

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub current_tasks: usize,
    pub processing_tasks: usize,
    pub failed_tasks: usize,
}

/// Source of tasks for a task manager
///
/// Enqueueing an id that is already queued or running fails; cancelling a
/// task that was dequeued fails; a refunded task is delivered again.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: TaskDescriptor) -> Result<(), QueueError>;

    /// Take the next task; with `async_only`, the next loop-aware one
    async fn dequeue(&self, async_only: bool) -> Result<Option<TaskDescriptor>, QueueError>;

    async fn cancel(&self, task_id: &TaskId) -> Result<(), QueueError>;

    async fn complete(&self, task_id: &TaskId) -> Result<(), QueueError>;

    async fn fail(&self, task_id: &TaskId) -> Result<(), QueueError>;

    /// Give a dequeued task back for redelivery
    async fn refund(&self, task: TaskDescriptor) -> Result<(), QueueError>;

    fn on_available_task(&self, callback: AvailableCallback);

    /// Number of tasks waiting to be dequeued
    async fn count(&self) -> Result<usize, QueueError>;

    async fn close(&self) -> Result<(), QueueError>;

    async fn info(&self) -> Result<QueueStats, QueueError>;
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<TaskDescriptor>,
    processing: HashMap<TaskId, TaskDescriptor>,
    failed: Vec<TaskDescriptor>,
    closed: bool,
}

/// FIFO queue kept in process memory, optionally mirrored into a [`TaskStorage`]
#[derive(Default)]
pub struct InMemoryTaskQueue {
    state: Mutex<QueueState>,
    storage: Option<Arc<dyn TaskStorage>>,
    on_available: Mutex<Option<AvailableCallback>>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue that records enqueued tasks as waiting and cancelled tasks as cancelled
    pub fn with_storage(storage: Arc<dyn TaskStorage>) -> Self {
        Self {
            storage: Some(storage),
            ..Self::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Tasks that reached the failed state, oldest first
    pub fn failed_tasks(&self) -> Vec<TaskDescriptor> {
        self.state().failed.clone()
    }

    pub fn clear_failed_tasks(&self) {
        self.state().failed.clear();
    }

    fn notify_available(&self) {
        let callback = self
            .on_available
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: TaskDescriptor) -> Result<(), QueueError> {
        {
            let mut state = self.state();
            if state.closed {
                return Err(QueueError::Closed);
            }
            if state.processing.contains_key(&task.id)
                || state.queue.iter().any(|queued| queued.id == task.id)
            {
                return Err(QueueError::DuplicateTask(task.id));
            }
            state.queue.push_back(task.clone());
        }

        if let Some(storage) = &self.storage {
            if let Err(e) = storage.insert(&task).await {
                warn!(task_id = %task.id, "Failed to record queued task: {}", e);
            }
        }

        debug!(task_id = %task.id, "Task enqueued");
        self.notify_available();
        Ok(())
    }

    async fn dequeue(&self, async_only: bool) -> Result<Option<TaskDescriptor>, QueueError> {
        let mut state = self.state();
        if state.closed {
            return Ok(None);
        }

        let task = if async_only {
            state
                .queue
                .iter()
                .position(|task| task.is_loop_aware())
                .and_then(|index| state.queue.remove(index))
        } else {
            state.queue.pop_front()
        };

        if let Some(task) = &task {
            state.processing.insert(task.id.clone(), task.clone());
        }
        Ok(task)
    }

    async fn cancel(&self, task_id: &TaskId) -> Result<(), QueueError> {
        let task = {
            let mut state = self.state();
            if state.processing.contains_key(task_id) {
                return Err(QueueError::AlreadyRunning(task_id.clone()));
            }
            let index = state
                .queue
                .iter()
                .position(|task| &task.id == task_id)
                .ok_or_else(|| QueueError::NotFound(task_id.clone()))?;
            state.queue.remove(index)
        };

        if let (Some(storage), Some(task)) = (&self.storage, task) {
            storage
                .cancel(&task)
                .await
                .map_err(|e| QueueError::Backend(e.to_string()))?;
        }
        Ok(())
    }

    async fn complete(&self, task_id: &TaskId) -> Result<(), QueueError> {
        self.state().processing.remove(task_id);
        Ok(())
    }

    async fn fail(&self, task_id: &TaskId) -> Result<(), QueueError> {
        let mut state = self.state();
        if let Some(task) = state.processing.remove(task_id) {
            state.failed.push(task);
        }
        Ok(())
    }

    async fn refund(&self, task: TaskDescriptor) -> Result<(), QueueError> {
        let mut state = self.state();
        state.processing.remove(&task.id);
        state.queue.push_front(task);
        Ok(())
    }

    fn on_available_task(&self, callback: AvailableCallback) {
        *self
            .on_available
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(callback);
    }

    async fn count(&self) -> Result<usize, QueueError> {
        Ok(self.state().queue.len())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.state().closed = true;
        Ok(())
    }

    async fn info(&self) -> Result<QueueStats, QueueError> {
        let state = self.state();
        Ok(QueueStats {
            current_tasks: state.queue.len(),
            processing_tasks: state.processing.len(),
            failed_tasks: state.failed.len(),
        })
    }
}
