//! Progress reporter: the per-task state machine shared across the process boundary
//!
//! A reporter tracks one task from `Processing` to a terminal state. The child
//! process mutates its own reporter and ships [`ReporterSnapshot`]s back; the
//! parent folds them into its instance with [`ProgressReporter::merge`], which
//! orders snapshots by their revision counter.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use crate::error::ExecutionError;
use crate::task::{TaskDescriptor, TaskId};

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Processing,
    Failed,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Completed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Processing => "processing",
            TaskStatus::Failed => "failed",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Wire form of a reporter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReporterSnapshot {
    pub task: TaskDescriptor,
    pub status: TaskStatus,
    #[serde(default)]
    pub message: String,
    pub completion: f64,
    pub completion_target: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    pub revision: u64,
}

impl ReporterSnapshot {
    fn new(task: TaskDescriptor, status: TaskStatus) -> Self {
        Self {
            task,
            status,
            message: String::new(),
            completion: 0.0,
            completion_target: 100.0,
            error: None,
            result: None,
            revision: 0,
        }
    }

    /// Record of a task that is queued but not yet running
    pub fn waiting(task: TaskDescriptor) -> Self {
        Self::new(task, TaskStatus::Waiting)
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task.id
    }
}

/// Notification fired by a reporter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReporterEvent {
    Change,
    Done,
    Failed,
}

/// Callback invoked for reporter events
pub type ReporterListener = Arc<dyn Fn(ReporterEvent, &ProgressReporter) + Send + Sync>;

/// Handle returned by [`ProgressReporter::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ReporterInner {
    state: Mutex<ReporterSnapshot>,
    listeners: Mutex<Vec<(ListenerId, ReporterListener)>>,
    next_listener: AtomicU64,
    terminal: watch::Sender<bool>,
}

/// Shared, cloneable progress record of one task
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<ReporterInner>,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("state", &*self.state())
            .finish()
    }
}

impl ProgressReporter {
    /// Reporter for a task that is about to run
    pub fn new(task: TaskDescriptor) -> Self {
        Self::from_snapshot(ReporterSnapshot::new(task, TaskStatus::Processing))
    }

    /// Rebuild a reporter from its wire form
    pub fn from_snapshot(snapshot: ReporterSnapshot) -> Self {
        let terminal = snapshot.status.is_terminal();
        Self {
            inner: Arc::new(ReporterInner {
                state: Mutex::new(snapshot),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                terminal: watch::Sender::new(terminal),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ReporterSnapshot> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> ReporterSnapshot {
        self.state().clone()
    }

    pub fn task(&self) -> TaskDescriptor {
        self.state().task.clone()
    }

    pub fn task_id(&self) -> TaskId {
        self.state().task.id.clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.state().status
    }

    pub fn message(&self) -> String {
        self.state().message.clone()
    }

    pub fn completion(&self) -> f64 {
        self.state().completion
    }

    pub fn completion_target(&self) -> f64 {
        self.state().completion_target
    }

    pub fn error(&self) -> Option<String> {
        self.state().error.clone()
    }

    pub fn result(&self) -> Option<JsonValue> {
        self.state().result.clone()
    }

    pub fn revision(&self) -> u64 {
        self.state().revision
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn set_message(&self, message: impl Into<String>) {
        let message = message.into();
        self.mutate(|state| state.message = message);
    }

    pub fn set_completion(&self, completion: f64) {
        self.mutate(|state| state.completion = completion);
    }

    pub fn set_completion_target(&self, target: f64) {
        self.mutate(|state| state.completion_target = target);
    }

    /// Apply a pre-terminal mutation; ignored once the task is terminal
    fn mutate(&self, apply: impl FnOnce(&mut ReporterSnapshot)) -> bool {
        {
            let mut state = self.state();
            if state.status.is_terminal() {
                return false;
            }
            apply(&mut state);
            state.revision += 1;
        }
        self.emit(ReporterEvent::Change);
        true
    }

    /// Mark the task completed; returns false if it was already terminal
    pub fn finish_task(&self, result: JsonValue) -> bool {
        {
            let mut state = self.state();
            if state.status.is_terminal() {
                return false;
            }
            state.status = TaskStatus::Completed;
            state.completion = state.completion_target;
            state.result = Some(result);
            state.error = None;
            state.revision += 1;
        }
        self.settle(ReporterEvent::Done);
        true
    }

    /// Mark the task failed; returns false if it was already terminal
    pub fn fail_task(&self, error: impl Into<String>, message: Option<String>) -> bool {
        {
            let mut state = self.state();
            if state.status.is_terminal() {
                return false;
            }
            state.status = TaskStatus::Failed;
            state.result = None;
            state.error = Some(error.into());
            if let Some(message) = message {
                state.message = message;
            }
            state.revision += 1;
        }
        self.settle(ReporterEvent::Failed);
        true
    }

    /// Fold a snapshot of the same task into this reporter
    ///
    /// Returns `Ok(false)` when the snapshot is stale (revision not newer) or
    /// this reporter is already terminal. A newer snapshot is adopted field by
    /// field without per-field events; a terminal snapshot then fires `Done`
    /// or `Failed` once, a non-terminal one fires a single `Change`.
    pub fn merge(&self, other: &ReporterSnapshot) -> Result<bool, ExecutionError> {
        let event = {
            let mut state = self.state();
            if state.task.id != other.task.id {
                return Err(ExecutionError::TaskMismatch {
                    expected: state.task.id.clone(),
                    actual: other.task.id.clone(),
                });
            }
            if other.revision <= state.revision || state.status.is_terminal() {
                return Ok(false);
            }

            state.message = other.message.clone();
            state.completion = other.completion;
            state.completion_target = other.completion_target;
            state.error = other.error.clone();
            state.result = other.result.clone();
            state.revision = other.revision;

            match other.status {
                TaskStatus::Completed => {
                    state.status = TaskStatus::Completed;
                    Some(ReporterEvent::Done)
                }
                TaskStatus::Failed => {
                    state.status = TaskStatus::Failed;
                    Some(ReporterEvent::Failed)
                }
                TaskStatus::Cancelled => {
                    state.status = TaskStatus::Cancelled;
                    None
                }
                TaskStatus::Waiting | TaskStatus::Processing => Some(ReporterEvent::Change),
            }
        };

        match event {
            Some(ReporterEvent::Change) => self.emit(ReporterEvent::Change),
            Some(terminal) => self.settle(terminal),
            None => {
                self.inner.terminal.send_replace(true);
            }
        }
        Ok(true)
    }

    fn settle(&self, event: ReporterEvent) {
        self.inner.terminal.send_replace(true);
        self.emit(event);
    }

    /// Register a listener for change/done/failed events
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(ReporterEvent, &ProgressReporter) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.listeners().retain(|(listener_id, _)| *listener_id != id);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(ListenerId, ReporterListener)>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Invoke listeners outside of any lock, in subscription order
    fn emit(&self, event: ReporterEvent) {
        let listeners: Vec<ReporterListener> = self
            .listeners()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(event, self);
        }
    }

    /// Resolve once the reporter reaches a terminal state
    pub async fn wait_terminal(&self) {
        let mut rx = self.inner.terminal.subscribe();
        let _ = rx.wait_for(|terminal| *terminal).await;
    }

    /// Whether both handles point at the same reporter
    pub fn ptr_eq(&self, other: &ProgressReporter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
