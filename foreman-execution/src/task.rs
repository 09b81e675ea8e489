//! Task contract: identity, kind, descriptors and the registry used by workers

use async_trait::async_trait;
use foreman_ipc::{IpcError, Messenger, RpcHandler};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::TaskError;
use crate::reporter::ProgressReporter;

/// Caller supplied task identifier, unique per outstanding task
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Execution capabilities of a task, fixed when the task type is declared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Runs to completion on a blocking thread and monopolises its process
    Sync,
    /// Suspends cooperatively; processes share their slots among such tasks
    Async,
    /// Long running, stops on an explicit termination signal
    Service,
    /// Service that also exposes named RPC methods
    IpcService,
}

impl TaskKind {
    pub fn is_loop_aware(&self) -> bool {
        !matches!(self, TaskKind::Sync)
    }

    pub fn is_service(&self) -> bool {
        matches!(self, TaskKind::Service | TaskKind::IpcService)
    }

    pub fn is_ipc_capable(&self) -> bool {
        matches!(self, TaskKind::IpcService)
    }
}

/// Serializable description of one task instance
///
/// Options are validated and normalised once, when the descriptor is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: TaskId,
    pub task_type: String,
    pub kind: TaskKind,
    pub options: JsonValue,
}

impl TaskDescriptor {
    /// Describe a task of type `T`, validating its options
    pub fn new<T: TaskDefinition>(
        id: impl Into<TaskId>,
        options: JsonValue,
    ) -> Result<Self, TaskError> {
        let parsed = T::parse_options(options)?;
        let options = serde_json::to_value(&parsed)
            .map_err(|e| TaskError::invalid_options(e.to_string()))?;
        // Building the task is the validation step; the instance itself is discarded.
        T::from_options(parsed)?;

        Ok(Self {
            id: id.into(),
            task_type: T::TASK_TYPE.to_string(),
            kind: T::KIND,
            options,
        })
    }

    pub fn is_loop_aware(&self) -> bool {
        self.kind.is_loop_aware()
    }

    pub fn is_service(&self) -> bool {
        self.kind.is_service()
    }

    pub fn is_ipc_capable(&self) -> bool {
        self.kind.is_ipc_capable()
    }
}

/// Static description of a task type
pub trait TaskDefinition: Sized + Send + Sync + 'static {
    /// Name used to find the type in a [`TaskRegistry`]
    const TASK_TYPE: &'static str;
    const KIND: TaskKind;

    type Options: Serialize + DeserializeOwned;

    /// Build the task, rejecting option combinations that deserialize but make no sense
    fn from_options(options: Self::Options) -> Result<Self, TaskError>;

    fn parse_options(options: JsonValue) -> Result<Self::Options, TaskError> {
        serde_json::from_value(options).map_err(|e| TaskError::invalid_options(e.to_string()))
    }
}

/// Asynchronous task body
///
/// If the body neither finished nor failed the reporter itself, `Ok(value)`
/// finishes it with `value` and `Err(e)` fails it with the error text.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    async fn run(&self, ctx: TaskContext, reporter: ProgressReporter)
        -> Result<JsonValue, TaskError>;

    /// Methods the parent may call on a running IPC service
    fn ipc_methods(&self) -> Vec<(&'static str, RpcHandler)> {
        Vec::new()
    }
}

/// Synchronous task body, executed on a blocking thread
pub trait SyncTask: Send + Sync + 'static {
    fn run(&self, reporter: &ProgressReporter) -> Result<JsonValue, TaskError>;
}

/// A task instance ready to execute
#[derive(Clone)]
pub enum Runnable {
    Sync(Arc<dyn SyncTask>),
    Async(Arc<dyn Task>),
}

/// Execution environment handed to asynchronous tasks
#[derive(Clone)]
pub struct TaskContext {
    terminate: watch::Receiver<bool>,
    messenger: Option<Messenger>,
    is_child: bool,
    _detached: Option<Arc<watch::Sender<bool>>>,
}

impl TaskContext {
    pub fn new(terminate: watch::Receiver<bool>, messenger: Option<Messenger>, is_child: bool) -> Self {
        Self {
            terminate,
            messenger,
            is_child,
            _detached: None,
        }
    }

    /// Context that is never asked to terminate, for running a task in place
    pub fn detached() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            _detached: Some(Arc::new(tx)),
            ..Self::new(rx, None, crate::env::is_child_process())
        }
    }

    /// Resolve once the hosting worker was asked to terminate
    pub async fn terminated(&self) {
        let mut rx = self.terminate.clone();
        let _ = rx.wait_for(|terminating| *terminating).await;
    }

    pub fn is_terminating(&self) -> bool {
        *self.terminate.borrow()
    }

    /// Whether this task runs inside a spawned worker process
    pub fn is_child(&self) -> bool {
        self.is_child
    }

    /// Call a method registered by the parent on this worker's connection
    pub async fn call_parent(&self, method: &str, payload: JsonValue) -> Result<JsonValue, IpcError> {
        match &self.messenger {
            Some(messenger) => messenger.rpc(method, payload).await,
            None => Err(IpcError::ConnectionClosed),
        }
    }
}

type Factory = Box<dyn Fn(JsonValue) -> Result<Runnable, TaskError> + Send + Sync>;

/// Maps task type names to constructors
#[derive(Default)]
pub struct TaskRegistry {
    factories: HashMap<String, (TaskKind, Factory)>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_sync<T: TaskDefinition + SyncTask>(&mut self) -> &mut Self {
        debug_assert_eq!(T::KIND, TaskKind::Sync);
        self.factories.insert(
            T::TASK_TYPE.to_string(),
            (
                T::KIND,
                Box::new(|options| {
                    let task = T::from_options(T::parse_options(options)?)?;
                    Ok(Runnable::Sync(Arc::new(task)))
                }),
            ),
        );
        self
    }

    pub fn register_async<T: TaskDefinition + Task>(&mut self) -> &mut Self {
        debug_assert!(T::KIND.is_loop_aware());
        self.factories.insert(
            T::TASK_TYPE.to_string(),
            (
                T::KIND,
                Box::new(|options| {
                    let task = T::from_options(T::parse_options(options)?)?;
                    Ok(Runnable::Async(Arc::new(task)))
                }),
            ),
        );
        self
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.factories.contains_key(task_type)
    }

    pub fn kind_of(&self, task_type: &str) -> Option<TaskKind> {
        self.factories.get(task_type).map(|(kind, _)| *kind)
    }

    /// Build a descriptor for a task type known only by name
    ///
    /// The options are checked by instantiating the task once.
    pub fn describe(
        &self,
        id: impl Into<TaskId>,
        task_type: &str,
        options: JsonValue,
    ) -> Result<TaskDescriptor, TaskError> {
        let kind = self
            .kind_of(task_type)
            .ok_or_else(|| TaskError::invalid_options(format!("unknown task type '{}'", task_type)))?;
        let descriptor = TaskDescriptor {
            id: id.into(),
            task_type: task_type.to_string(),
            kind,
            options,
        };
        self.build(&descriptor)?;
        Ok(descriptor)
    }

    /// Instantiate the task a descriptor refers to
    pub fn build(&self, descriptor: &TaskDescriptor) -> Result<Runnable, TaskError> {
        let (kind, factory) = self.factories.get(&descriptor.task_type).ok_or_else(|| {
            TaskError::invalid_options(format!("unknown task type '{}'", descriptor.task_type))
        })?;

        if *kind != descriptor.kind {
            return Err(TaskError::invalid_options(format!(
                "task type '{}' is {:?}, descriptor says {:?}",
                descriptor.task_type, kind, descriptor.kind
            )));
        }

        factory(descriptor.options.clone())
    }
}
