//! Child side of a worker process
//!
//! The runtime accepts `submit-task` calls, runs each task with its own
//! [`ProgressReporter`] and streams every reporter event back to the parent as
//! a `task-report` call carrying a [`ReporterSnapshot`].

use foreman_ipc::{handler, methods, Messenger, RemoteError, RpcResult, StdioTransport};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ExecutionError, TaskError};
use crate::reporter::{ProgressReporter, ReporterSnapshot};
use crate::task::{Runnable, TaskContext, TaskDescriptor, TaskId, TaskKind, TaskRegistry};

struct RunningTask {
    kind: TaskKind,
    ipc_methods: Vec<&'static str>,
    handle: Option<JoinHandle<()>>,
}

struct RuntimeState {
    tasks: Mutex<HashMap<TaskId, RunningTask>>,
    terminate: watch::Sender<bool>,
}

impl RuntimeState {
    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskId, RunningTask>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A validated submission whose body has not been polled yet
struct PreparedTask {
    task_id: TaskId,
    execution: BoxFuture<'static, ()>,
    state: Weak<RuntimeState>,
}

impl PreparedTask {
    /// Poll the body once before acknowledging, so that anything it reports
    /// synchronously (including an immediate failure) reaches the parent first
    async fn start(self) -> RpcResult {
        let PreparedTask { task_id, mut execution, state } = self;
        if futures::poll!(execution.as_mut()).is_pending() {
            let handle = tokio::spawn(execution);
            match state.upgrade() {
                Some(state) => match state.tasks().get_mut(&task_id) {
                    Some(running) => running.handle = Some(handle),
                    None => handle.abort(),
                },
                None => handle.abort(),
            }
        }
        Ok(json!({ "accepted": task_id }))
    }
}

/// Executes tasks received from the parent process
pub struct WorkerRuntime {
    registry: Arc<TaskRegistry>,
    messenger: Messenger,
    state: Arc<RuntimeState>,
}

impl WorkerRuntime {
    pub fn new(registry: Arc<TaskRegistry>, messenger: Messenger) -> Self {
        let (terminate, _) = watch::channel(false);
        Self {
            registry,
            messenger,
            state: Arc::new(RuntimeState {
                tasks: Mutex::new(HashMap::new()),
                terminate,
            }),
        }
    }

    /// Serve the parent until it asks us to terminate or goes away
    pub async fn run(self) -> Result<(), ExecutionError> {
        let this = Arc::new(self);

        this.messenger.register_rpc(
            methods::PING,
            handler(|_| async { Ok(json!({ "pid": std::process::id() })) }),
        );

        let weak = Arc::downgrade(&this);
        this.messenger.register_rpc(
            methods::SUBMIT_TASK,
            handler(move |payload| {
                let prepared = match weak.upgrade() {
                    Some(runtime) => runtime.prepare(payload),
                    None => Err(RemoteError::new("worker is shutting down")),
                };
                async move { prepared?.start().await }
            }),
        );

        let mut terminate = this.messenger.terminate_requested();
        tokio::select! {
            _ = async { let _ = terminate.wait_for(|requested| *requested).await; } => {
                info!("Termination requested by parent");
                this.stop_tasks(true).await;
            }
            _ = this.messenger.closed() => {
                info!("Parent connection closed");
                this.stop_tasks(false).await;
            }
        }

        this.messenger.shutdown().await;
        debug!("Worker runtime stopped");
        Ok(())
    }

    fn prepare(&self, payload: JsonValue) -> Result<PreparedTask, RemoteError> {
        let descriptor: TaskDescriptor = serde_json::from_value(payload)
            .map_err(|e| RemoteError::new(format!("Task cannot be decoded: {}", e)))?;

        if *self.state.terminate.borrow() {
            return Err(RemoteError::new("worker is terminating"));
        }

        let runnable = self.registry.build(&descriptor).map_err(RemoteError::from)?;
        let task_id = descriptor.id.clone();

        let ipc_methods = match &runnable {
            Runnable::Async(task) if descriptor.is_ipc_capable() => task.ipc_methods(),
            _ => Vec::new(),
        };

        {
            let mut tasks = self.state.tasks();
            if tasks.contains_key(&task_id) {
                return Err(RemoteError::new(format!("task {} is already running", task_id)));
            }
            tasks.insert(
                task_id.clone(),
                RunningTask {
                    kind: descriptor.kind,
                    ipc_methods: ipc_methods.iter().map(|(name, _)| *name).collect(),
                    handle: None,
                },
            );
        }

        for (name, method) in ipc_methods {
            self.messenger.register_rpc(name, method);
        }

        let reporter = ProgressReporter::new(descriptor);
        let messenger = self.messenger.clone();
        reporter.subscribe(move |_, reporter| {
            forward_report(&messenger, &reporter.snapshot());
        });

        debug!(task_id = %task_id, "Starting task");
        Ok(PreparedTask {
            execution: self.execution(task_id.clone(), runnable, reporter),
            task_id,
            state: Arc::downgrade(&self.state),
        })
    }

    fn execution(&self, task_id: TaskId, runnable: Runnable, reporter: ProgressReporter) -> BoxFuture<'static, ()> {
        let state = Arc::downgrade(&self.state);
        let messenger = self.messenger.clone();
        let ctx = TaskContext::new(
            self.state.terminate.subscribe(),
            Some(self.messenger.clone()),
            true,
        );

        async move {
            let outcome = match runnable {
                Runnable::Sync(task) => {
                    let blocking_reporter = reporter.clone();
                    tokio::task::spawn_blocking(move || task.run(&blocking_reporter))
                        .await
                        .map_err(|_| "task panicked".to_string())
                }
                Runnable::Async(task) => AssertUnwindSafe(task.run(ctx, reporter.clone()))
                    .catch_unwind()
                    .await
                    .map_err(|_| "task panicked".to_string()),
            };
            settle(&reporter, outcome);

            if let Some(state) = state.upgrade() {
                if let Some(running) = state.tasks().remove(&task_id) {
                    for name in running.ipc_methods {
                        messenger.unregister_rpc(name);
                    }
                }
            }
        }
        .boxed()
    }

    /// Stop running tasks; on graceful termination services get to finish
    async fn stop_tasks(&self, graceful: bool) {
        self.state.terminate.send_replace(true);

        let running: Vec<(TaskId, RunningTask)> = self.state.tasks().drain().collect();
        for (task_id, task) in running {
            let Some(handle) = task.handle else {
                continue;
            };
            if graceful && task.kind.is_service() {
                debug!(task_id = %task_id, "Waiting for service task to stop");
                if let Err(e) = handle.await {
                    warn!(task_id = %task_id, "Service task ended abnormally: {}", e);
                }
            } else {
                handle.abort();
            }
        }
    }
}

fn forward_report(messenger: &Messenger, snapshot: &ReporterSnapshot) {
    match serde_json::to_value(snapshot) {
        Ok(payload) => {
            if let Err(e) = messenger.rpc_detached(methods::TASK_REPORT, payload) {
                debug!(task_id = %snapshot.task.id, "Dropping task report: {}", e);
            }
        }
        Err(e) => error!(task_id = %snapshot.task.id, "Failed to encode task report: {}", e),
    }
}

/// Finish or fail the reporter from the task body's outcome, unless the body already did
fn settle(reporter: &ProgressReporter, outcome: Result<Result<JsonValue, TaskError>, String>) {
    match outcome {
        Ok(Ok(value)) => {
            reporter.finish_task(value);
        }
        Ok(Err(err)) => {
            reporter.fail_task(err.to_string(), None);
        }
        Err(panic) => {
            reporter.fail_task(panic, None);
        }
    }
}

/// Entry point of a spawned worker process: serve the parent over stdio
pub async fn run_worker_process(registry: TaskRegistry) -> Result<(), ExecutionError> {
    info!(pid = std::process::id(), "Worker process started");
    let messenger = Messenger::spawn(StdioTransport::connect());
    WorkerRuntime::new(Arc::new(registry), messenger).run().await
}
