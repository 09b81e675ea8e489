//! Error types for task execution

use foreman_ipc::{IpcError, RemoteError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::task::TaskId;

/// Errors raised by a task itself
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    /// The task could not be built from its options
    #[error("Invalid task options: {message}")]
    OptionValidation { message: String },

    /// The task body failed
    #[error("{message}")]
    Runtime {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<JsonValue>,
    },
}

impl TaskError {
    pub fn invalid_options(message: impl Into<String>) -> Self {
        TaskError::OptionValidation {
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        TaskError::Runtime {
            message: message.into(),
            details: None,
        }
    }
}

impl From<TaskError> for RemoteError {
    fn from(err: TaskError) -> Self {
        let details = serde_json::to_value(&err).ok();
        let remote = RemoteError::new(err.to_string());
        match details {
            Some(details) => remote.with_details(details),
            None => remote,
        }
    }
}

/// Queue contract violations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("Task {0} is already queued")]
    DuplicateTask(TaskId),

    #[error("Task {0} is already running")]
    AlreadyRunning(TaskId),

    #[error("Task {0} does not exist")]
    NotFound(TaskId),

    #[error("Queue is closed")]
    Closed,

    #[error("Queue backend error: {0}")]
    Backend(String),
}

/// Task execution errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("No worker capacity available")]
    NoCapacity,

    #[error("IPC error: {0}")]
    Transport(#[from] IpcError),

    #[error("Failed to spawn worker process: {0}")]
    Spawn(String),

    #[error("Reporter for task {expected} cannot merge a snapshot of task {actual}")]
    TaskMismatch { expected: TaskId, actual: TaskId },

    #[error("Service {0} is already registered")]
    DuplicateService(TaskId),

    #[error("Service {0} is not registered")]
    UnknownService(TaskId),

    #[error("Task {0} is not a service task")]
    NotAService(TaskId),

    #[error("Service {0} does not expose IPC methods")]
    NotIpcCapable(TaskId),

    #[error("Service {0} is not running")]
    ServiceNotRunning(TaskId),

    #[error("Service failed to start: {0}")]
    ServiceFailed(String),

    #[error("Task storage is not configured")]
    NoStorage,

    #[error("Invalid execution state: {0}")]
    InvalidState(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl ExecutionError {
    /// Failures that return a task to the queue instead of failing it
    pub fn is_dispatch_failure(&self) -> bool {
        matches!(
            self,
            ExecutionError::NoCapacity | ExecutionError::Transport(_) | ExecutionError::Spawn(_)
        )
    }
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;
