//! Task execution for Foreman
//!
//! This crate provides the task contract, progress reporting, the worker
//! pool with its child-side runtime, the queue-driven task manager and the
//! service manager supervising long-running tasks.

pub mod client;
pub mod env;
pub mod error;
pub mod manager;
pub mod pool;
pub mod pool_worker;
pub mod process;
pub mod queue;
pub mod reporter;
pub mod service;
pub mod storage;
pub mod task;
pub mod worker;

#[cfg(test)]
mod fixtures;

// Re-export commonly used types
pub use client::Client;
pub use env::{is_child_process, CHILD_ENV_VAR};
pub use error::{ExecutionError, ExecutionResult, QueueError, TaskError};
pub use manager::{ManagerEvent, ManagerStats, SubmittedTask, TaskManager};
pub use pool::{PoolStats, WorkerPool};
pub use pool_worker::{PoolWorker, WorkerEvent};
pub use process::{
    CommandLauncher, LocalLauncher, ProcessCollection, ProcessControl, ProcessLauncher,
    ProcessSignal, SpawnedProcess,
};
pub use queue::{AvailableCallback, InMemoryTaskQueue, QueueStats, TaskQueue};
pub use reporter::{ListenerId, ProgressReporter, ReporterEvent, ReporterSnapshot, TaskStatus};
pub use service::{
    Promise, ServiceEvent, ServiceInfo, ServiceManager, ServiceStart, ServiceStatus, StartOutcome,
};
pub use storage::{InMemoryTaskStorage, TaskStorage};
pub use task::{
    Runnable, SyncTask, Task, TaskContext, TaskDefinition, TaskDescriptor, TaskId, TaskKind,
    TaskRegistry,
};
pub use worker::{run_worker_process, WorkerRuntime};
