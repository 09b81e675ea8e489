//! Task types shipped with the CLI
//!
//! The same registry is used by the parent, to validate submitted options,
//! and by worker processes, to run the tasks.

use async_trait::async_trait;
use axum::Router;
use foreman_execution::{
    ProgressReporter, SyncTask, Task, TaskContext, TaskDefinition, TaskError, TaskKind,
    TaskRegistry,
};
use foreman_ipc::{handler, RpcHandler};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::debug;

pub fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register_async::<Sleep>()
        .register_sync::<WordCount>()
        .register_async::<HttpRespond>()
        .register_async::<Counter>();
    registry
}

fn default_millis() -> u64 {
    1000
}

fn default_steps() -> u32 {
    10
}

#[derive(Serialize, Deserialize)]
pub struct SleepOptions {
    #[serde(default = "default_millis")]
    pub millis: u64,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default)]
    pub value: JsonValue,
}

/// Waits in steps, reporting progress after each, then returns `value`
pub struct Sleep {
    options: SleepOptions,
}

impl TaskDefinition for Sleep {
    const TASK_TYPE: &'static str = "sleep";
    const KIND: TaskKind = TaskKind::Async;
    type Options = SleepOptions;

    fn from_options(options: SleepOptions) -> Result<Self, TaskError> {
        if options.steps == 0 {
            return Err(TaskError::invalid_options("steps must be at least 1"));
        }
        Ok(Self { options })
    }
}

#[async_trait]
impl Task for Sleep {
    async fn run(&self, ctx: TaskContext, reporter: ProgressReporter) -> Result<JsonValue, TaskError> {
        let steps = self.options.steps;
        let step = Duration::from_millis(self.options.millis / u64::from(steps));
        reporter.set_completion_target(f64::from(steps));

        for done in 1..=steps {
            tokio::select! {
                _ = tokio::time::sleep(step) => {}
                _ = ctx.terminated() => return Err(TaskError::runtime("interrupted")),
            }
            reporter.set_completion(f64::from(done));
        }
        Ok(self.options.value.clone())
    }
}

#[derive(Serialize, Deserialize)]
pub struct WordCountOptions {
    pub text: String,
}

/// Counts lines, words and bytes of a text
pub struct WordCount {
    text: String,
}

impl TaskDefinition for WordCount {
    const TASK_TYPE: &'static str = "word-count";
    const KIND: TaskKind = TaskKind::Sync;
    type Options = WordCountOptions;

    fn from_options(options: WordCountOptions) -> Result<Self, TaskError> {
        Ok(Self { text: options.text })
    }
}

impl SyncTask for WordCount {
    fn run(&self, reporter: &ProgressReporter) -> Result<JsonValue, TaskError> {
        reporter.set_message("counting");
        Ok(json!({
            "lines": self.text.lines().count(),
            "words": self.text.split_whitespace().count(),
            "bytes": self.text.len(),
        }))
    }
}

#[derive(Serialize, Deserialize)]
pub struct HttpRespondOptions {
    pub port: u16,
    #[serde(default)]
    pub body: String,
}

/// Answers every HTTP request on a local port with a fixed body
pub struct HttpRespond {
    options: HttpRespondOptions,
}

impl TaskDefinition for HttpRespond {
    const TASK_TYPE: &'static str = "http-respond";
    const KIND: TaskKind = TaskKind::Service;
    type Options = HttpRespondOptions;

    fn from_options(options: HttpRespondOptions) -> Result<Self, TaskError> {
        if options.port == 0 {
            return Err(TaskError::invalid_options("port must be set"));
        }
        Ok(Self { options })
    }
}

#[async_trait]
impl Task for HttpRespond {
    async fn run(&self, ctx: TaskContext, reporter: ProgressReporter) -> Result<JsonValue, TaskError> {
        let port = self.options.port;
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| TaskError::runtime(format!("cannot listen on {}: {}", port, e)))?;

        let served = Arc::new(AtomicU64::new(0));
        let router = Router::new().fallback({
            let body = self.options.body.clone();
            let served = served.clone();
            move || {
                served.fetch_add(1, Ordering::SeqCst);
                let body = body.clone();
                async move { body }
            }
        });

        reporter.set_message(format!("listening on {}", port));
        debug!(port, "HTTP responder started");
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { ctx.terminated().await })
            .await
            .map_err(|e| TaskError::runtime(format!("HTTP server on {} failed: {}", port, e)))?;

        Ok(json!({ "served": served.load(Ordering::SeqCst) }))
    }
}

#[derive(Serialize, Deserialize)]
pub struct CounterOptions {
    #[serde(default)]
    pub start: u64,
}

/// IPC service holding a counter, exposing `increment` and `get`
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl TaskDefinition for Counter {
    const TASK_TYPE: &'static str = "counter";
    const KIND: TaskKind = TaskKind::IpcService;
    type Options = CounterOptions;

    fn from_options(options: CounterOptions) -> Result<Self, TaskError> {
        Ok(Self {
            value: Arc::new(AtomicU64::new(options.start)),
        })
    }
}

#[async_trait]
impl Task for Counter {
    async fn run(&self, ctx: TaskContext, reporter: ProgressReporter) -> Result<JsonValue, TaskError> {
        reporter.set_message("counting");
        ctx.terminated().await;
        Ok(json!(self.value.load(Ordering::SeqCst)))
    }

    fn ipc_methods(&self) -> Vec<(&'static str, RpcHandler)> {
        let increment = self.value.clone();
        let get = self.value.clone();
        vec![
            (
                "increment",
                handler(move |payload| {
                    let by = payload.get("by").and_then(JsonValue::as_u64).unwrap_or(1);
                    let value = increment.fetch_add(by, Ordering::SeqCst) + by;
                    async move { Ok(json!(value)) }
                }),
            ),
            (
                "get",
                handler(move |_| {
                    let value = get.load(Ordering::SeqCst);
                    async move { Ok(json!(value)) }
                }),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_execution::{Runnable, TaskStatus};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::watch;

    #[test]
    fn test_registry_validates_options() {
        let registry = registry();
        assert!(registry.describe("a", "sleep", json!({"millis": 10})).is_ok());
        assert!(registry.describe("b", "sleep", json!({"steps": 0})).is_err());
        assert!(registry.describe("c", "http-respond", json!({})).is_err());
        assert_eq!(registry.kind_of("counter"), Some(TaskKind::IpcService));
    }

    #[test]
    fn test_word_count() {
        let registry = registry();
        let descriptor = registry
            .describe("wc", "word-count", json!({"text": "one two\nthree"}))
            .unwrap();
        let reporter = ProgressReporter::new(descriptor.clone());
        match registry.build(&descriptor).unwrap() {
            Runnable::Sync(task) => {
                let counts = task.run(&reporter).unwrap();
                assert_eq!(counts, json!({"lines": 2, "words": 3, "bytes": 13}));
            }
            Runnable::Async(_) => panic!("word-count is sync"),
        }
        assert_eq!(reporter.status(), TaskStatus::Processing);
    }

    async fn start_http_respond(
        port: u16,
        body: &str,
    ) -> (watch::Sender<bool>, tokio::task::JoinHandle<Result<JsonValue, TaskError>>) {
        let registry = registry();
        let descriptor = registry
            .describe("http", "http-respond", json!({"port": port, "body": body}))
            .unwrap();
        let reporter = ProgressReporter::new(descriptor.clone());
        let Runnable::Async(task) = registry.build(&descriptor).unwrap() else {
            panic!("http-respond is async");
        };

        let (terminate, rx) = watch::channel(false);
        let ctx = TaskContext::new(rx, None, false);
        let running = tokio::spawn({
            let reporter = reporter.clone();
            async move { task.run(ctx, reporter).await }
        });

        tokio::time::timeout(Duration::from_secs(2), async {
            while !reporter.message().starts_with("listening") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        (terminate, running)
    }

    #[tokio::test]
    async fn test_http_respond_serves_body_until_terminated() {
        let (terminate, running) = start_http_respond(39841, "Hello").await;

        for path in ["/", "/any/path"] {
            let response = reqwest::get(format!("http://127.0.0.1:39841{}", path)).await.unwrap();
            assert!(response.status().is_success());
            assert_eq!(response.text().await.unwrap(), "Hello");
        }

        terminate.send_replace(true);
        let served = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(served, json!({"served": 2}));
    }

    #[tokio::test]
    async fn test_http_respond_drops_endless_request_head() {
        let (terminate, running) = start_http_respond(39842, "ok").await;

        tokio::time::timeout(Duration::from_secs(5), async {
            let mut stream = TcpStream::connect(("127.0.0.1", 39842)).await.unwrap();
            let chunk = vec![b'a'; 64 * 1024];
            // The server closes the connection once the head grows too large
            for _ in 0..32 {
                if stream.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        })
        .await
        .unwrap();

        let response = reqwest::get("http://127.0.0.1:39842/").await.unwrap();
        assert_eq!(response.text().await.unwrap(), "ok");

        terminate.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_sleep_reports_each_step() {
        let registry = registry();
        let descriptor = registry
            .describe("s", "sleep", json!({"millis": 40, "steps": 4, "value": "done"}))
            .unwrap();
        let reporter = ProgressReporter::new(descriptor.clone());
        let Runnable::Async(task) = registry.build(&descriptor).unwrap() else {
            panic!("sleep is async");
        };

        let value = task.run(TaskContext::detached(), reporter.clone()).await.unwrap();
        assert_eq!(value, json!("done"));
        assert_eq!(reporter.completion(), 4.0);
        assert_eq!(reporter.completion_target(), 4.0);
    }
}
