//! Tasks shared by the unit tests of this crate

use async_trait::async_trait;
use foreman_ipc::{handler, RpcHandler};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;

use crate::error::TaskError;
use crate::process::{LocalLauncher, ProcessCollection};
use crate::reporter::ProgressReporter;
use crate::task::{SyncTask, Task, TaskContext, TaskDefinition, TaskDescriptor, TaskKind, TaskRegistry};

#[derive(Serialize, Deserialize)]
pub struct SleepOptions {
    pub millis: u64,
    #[serde(default)]
    pub value: JsonValue,
}

/// Async task resolving to `value` after `millis`
pub struct Sleep {
    options: SleepOptions,
}

impl TaskDefinition for Sleep {
    const TASK_TYPE: &'static str = "test-sleep";
    const KIND: TaskKind = TaskKind::Async;
    type Options = SleepOptions;

    fn from_options(options: SleepOptions) -> Result<Self, TaskError> {
        Ok(Self { options })
    }
}

#[async_trait]
impl Task for Sleep {
    async fn run(&self, _ctx: TaskContext, reporter: ProgressReporter) -> Result<JsonValue, TaskError> {
        tokio::time::sleep(Duration::from_millis(self.options.millis)).await;
        reporter.set_completion(50.0);
        Ok(self.options.value.clone())
    }
}

#[derive(Serialize, Deserialize)]
pub struct HoldOptions {
    pub millis: u64,
}

/// Sync task that blocks its thread for `millis`
pub struct Hold {
    millis: u64,
}

impl TaskDefinition for Hold {
    const TASK_TYPE: &'static str = "test-hold";
    const KIND: TaskKind = TaskKind::Sync;
    type Options = HoldOptions;

    fn from_options(options: HoldOptions) -> Result<Self, TaskError> {
        Ok(Self { millis: options.millis })
    }
}

impl SyncTask for Hold {
    fn run(&self, _reporter: &ProgressReporter) -> Result<JsonValue, TaskError> {
        std::thread::sleep(Duration::from_millis(self.millis));
        Ok(json!("held"))
    }
}

#[derive(Serialize, Deserialize)]
pub struct FailOptions {
    pub error: String,
}

/// Sync task failing with `error`
pub struct Fail {
    error: String,
}

impl TaskDefinition for Fail {
    const TASK_TYPE: &'static str = "test-fail";
    const KIND: TaskKind = TaskKind::Sync;
    type Options = FailOptions;

    fn from_options(options: FailOptions) -> Result<Self, TaskError> {
        Ok(Self { error: options.error })
    }
}

impl SyncTask for Fail {
    fn run(&self, _reporter: &ProgressReporter) -> Result<JsonValue, TaskError> {
        Err(TaskError::runtime(self.error.clone()))
    }
}

#[derive(Serialize, Deserialize)]
pub struct ServeOptions {
    #[serde(default)]
    pub fail: bool,
}

/// Service that runs until terminated, or fails at once when `fail` is set
pub struct Serve {
    fail: bool,
}

impl TaskDefinition for Serve {
    const TASK_TYPE: &'static str = "test-serve";
    const KIND: TaskKind = TaskKind::Service;
    type Options = ServeOptions;

    fn from_options(options: ServeOptions) -> Result<Self, TaskError> {
        Ok(Self { fail: options.fail })
    }
}

#[async_trait]
impl Task for Serve {
    async fn run(&self, ctx: TaskContext, reporter: ProgressReporter) -> Result<JsonValue, TaskError> {
        if self.fail {
            return Err(TaskError::runtime("service crashed"));
        }
        reporter.set_message("serving");
        ctx.terminated().await;
        Ok(json!("stopped"))
    }
}

/// Service that never returns, even once asked to terminate
pub struct Stubborn;

impl TaskDefinition for Stubborn {
    const TASK_TYPE: &'static str = "test-stubborn";
    const KIND: TaskKind = TaskKind::Service;
    type Options = EchoOptions;

    fn from_options(_: EchoOptions) -> Result<Self, TaskError> {
        Ok(Self)
    }
}

#[async_trait]
impl Task for Stubborn {
    async fn run(&self, _ctx: TaskContext, reporter: ProgressReporter) -> Result<JsonValue, TaskError> {
        reporter.set_message("ignoring termination");
        futures::future::pending::<()>().await;
        Ok(JsonValue::Null)
    }
}

#[derive(Serialize, Deserialize)]
pub struct EchoOptions {}

/// IPC service answering `echo` with the call payload
pub struct EchoService;

impl TaskDefinition for EchoService {
    const TASK_TYPE: &'static str = "test-echo";
    const KIND: TaskKind = TaskKind::IpcService;
    type Options = EchoOptions;

    fn from_options(_: EchoOptions) -> Result<Self, TaskError> {
        Ok(Self)
    }
}

#[async_trait]
impl Task for EchoService {
    async fn run(&self, ctx: TaskContext, reporter: ProgressReporter) -> Result<JsonValue, TaskError> {
        reporter.set_message("listening");
        ctx.terminated().await;
        Ok(JsonValue::Null)
    }

    fn ipc_methods(&self) -> Vec<(&'static str, RpcHandler)> {
        vec![("echo", handler(|payload| async move { Ok(payload) }))]
    }
}

pub fn registry() -> Arc<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    registry
        .register_async::<Sleep>()
        .register_sync::<Hold>()
        .register_sync::<Fail>()
        .register_async::<Serve>()
        .register_async::<Stubborn>()
        .register_async::<EchoService>();
    Arc::new(registry)
}

pub fn local_processes() -> ProcessCollection {
    ProcessCollection::single(Arc::new(LocalLauncher::new(registry())), 1)
}

pub fn sleep(id: &str, millis: u64, value: JsonValue) -> TaskDescriptor {
    TaskDescriptor::new::<Sleep>(id, json!({"millis": millis, "value": value})).unwrap()
}

pub fn hold(id: &str, millis: u64) -> TaskDescriptor {
    TaskDescriptor::new::<Hold>(id, json!({"millis": millis})).unwrap()
}

pub fn fail(id: &str, error: &str) -> TaskDescriptor {
    TaskDescriptor::new::<Fail>(id, json!({"error": error})).unwrap()
}

pub fn serve(id: &str, fail: bool) -> TaskDescriptor {
    TaskDescriptor::new::<Serve>(id, json!({"fail": fail})).unwrap()
}

pub fn echo_service(id: &str) -> TaskDescriptor {
    TaskDescriptor::new::<EchoService>(id, json!({})).unwrap()
}

pub fn stubborn(id: &str) -> TaskDescriptor {
    TaskDescriptor::new::<Stubborn>(id, json!({})).unwrap()
}
