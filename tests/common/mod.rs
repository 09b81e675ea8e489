//! Task types and helpers shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use foreman_execution::{
    LocalLauncher, ProcessCollection, ProgressReporter, SyncTask, Task, TaskContext,
    TaskDefinition, TaskDescriptor, TaskError, TaskKind, TaskRegistry,
};
use foreman_ipc::{handler, RemoteError, RpcHandler};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Serialize, Deserialize)]
pub struct ReturnAfterOptions {
    pub seconds: f64,
    pub value: JsonValue,
}

/// Resolves with `value` after `seconds`
pub struct ReturnAfter {
    options: ReturnAfterOptions,
}

impl TaskDefinition for ReturnAfter {
    const TASK_TYPE: &'static str = "return-after";
    const KIND: TaskKind = TaskKind::Async;
    type Options = ReturnAfterOptions;

    fn from_options(options: ReturnAfterOptions) -> Result<Self, TaskError> {
        if options.seconds < 0.0 {
            return Err(TaskError::invalid_options("seconds cannot be negative"));
        }
        Ok(Self { options })
    }
}

#[async_trait]
impl Task for ReturnAfter {
    async fn run(&self, _ctx: TaskContext, reporter: ProgressReporter) -> Result<JsonValue, TaskError> {
        reporter.set_message("waiting");
        tokio::time::sleep(Duration::from_secs_f64(self.options.seconds)).await;
        Ok(self.options.value.clone())
    }
}

#[derive(Serialize, Deserialize)]
pub struct ThrowOptions {
    pub message: String,
}

/// Synchronous task that always fails with `message`
pub struct Throw {
    message: String,
}

impl TaskDefinition for Throw {
    const TASK_TYPE: &'static str = "throw";
    const KIND: TaskKind = TaskKind::Sync;
    type Options = ThrowOptions;

    fn from_options(options: ThrowOptions) -> Result<Self, TaskError> {
        Ok(Self {
            message: options.message,
        })
    }
}

impl SyncTask for Throw {
    fn run(&self, _reporter: &ProgressReporter) -> Result<JsonValue, TaskError> {
        Err(TaskError::runtime(self.message.clone()))
    }
}

#[derive(Serialize, Deserialize)]
pub struct HttpTextOptions {
    pub port: u16,
    pub text: String,
}

/// Service answering every HTTP request with a fixed text
pub struct HttpText {
    options: HttpTextOptions,
}

impl TaskDefinition for HttpText {
    const TASK_TYPE: &'static str = "http-text";
    const KIND: TaskKind = TaskKind::Service;
    type Options = HttpTextOptions;

    fn from_options(options: HttpTextOptions) -> Result<Self, TaskError> {
        Ok(Self { options })
    }
}

#[async_trait]
impl Task for HttpText {
    async fn run(&self, ctx: TaskContext, reporter: ProgressReporter) -> Result<JsonValue, TaskError> {
        let listener = TcpListener::bind(("127.0.0.1", self.options.port))
            .await
            .map_err(|e| TaskError::runtime(e.to_string()))?;
        let text = self.options.text.clone();
        let app = Router::new().fallback(move || {
            let text = text.clone();
            async move { text }
        });

        reporter.set_message(format!("listening on {}", self.options.port));
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { ctx.terminated().await })
            .await
            .map_err(|e| TaskError::runtime(e.to_string()))?;
        Ok(json!("stopped"))
    }
}

#[derive(Serialize, Deserialize)]
pub struct NoOptions {}

/// Service that fails as soon as it starts
pub struct FailingService;

impl TaskDefinition for FailingService {
    const TASK_TYPE: &'static str = "failing-service";
    const KIND: TaskKind = TaskKind::Service;
    type Options = NoOptions;

    fn from_options(_: NoOptions) -> Result<Self, TaskError> {
        Ok(Self)
    }
}

#[async_trait]
impl Task for FailingService {
    async fn run(&self, _ctx: TaskContext, _reporter: ProgressReporter) -> Result<JsonValue, TaskError> {
        Err(TaskError::runtime("Failing service"))
    }
}

/// IPC service exposing `add`
pub struct Adder;

impl TaskDefinition for Adder {
    const TASK_TYPE: &'static str = "adder";
    const KIND: TaskKind = TaskKind::IpcService;
    type Options = NoOptions;

    fn from_options(_: NoOptions) -> Result<Self, TaskError> {
        Ok(Self)
    }
}

#[async_trait]
impl Task for Adder {
    async fn run(&self, ctx: TaskContext, _reporter: ProgressReporter) -> Result<JsonValue, TaskError> {
        ctx.terminated().await;
        Ok(JsonValue::Null)
    }

    fn ipc_methods(&self) -> Vec<(&'static str, RpcHandler)> {
        vec![(
            "add",
            handler(|payload| async move {
                let a = payload.get("a").and_then(JsonValue::as_i64);
                let b = payload.get("b").and_then(JsonValue::as_i64);
                match (a, b) {
                    (Some(a), Some(b)) => Ok(json!(a + b)),
                    _ => Err(RemoteError::new("add expects integers a and b")),
                }
            }),
        )]
    }
}

pub fn registry() -> Arc<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    registry
        .register_async::<ReturnAfter>()
        .register_sync::<Throw>()
        .register_async::<HttpText>()
        .register_async::<FailingService>()
        .register_async::<Adder>();
    Arc::new(registry)
}

pub fn processes() -> ProcessCollection {
    ProcessCollection::single(Arc::new(LocalLauncher::new(registry())), 2)
}

pub fn return_after(id: &str, seconds: f64, value: JsonValue) -> TaskDescriptor {
    TaskDescriptor::new::<ReturnAfter>(id, json!({"seconds": seconds, "value": value})).unwrap()
}

pub fn throw(id: &str, message: &str) -> TaskDescriptor {
    TaskDescriptor::new::<Throw>(id, json!({"message": message})).unwrap()
}

pub fn http_text(id: &str, port: u16, text: &str) -> TaskDescriptor {
    TaskDescriptor::new::<HttpText>(id, json!({"port": port, "text": text})).unwrap()
}

pub fn failing_service(id: &str) -> TaskDescriptor {
    TaskDescriptor::new::<FailingService>(id, json!({})).unwrap()
}

pub fn adder(id: &str) -> TaskDescriptor {
    TaskDescriptor::new::<Adder>(id, json!({})).unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
