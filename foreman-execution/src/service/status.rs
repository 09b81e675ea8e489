//! Supervision state of one registered service

use foreman_config::ServiceOptions;
use futures::future::{FutureExt, Shared};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::pool_worker::PoolWorker;
use crate::reporter::{ProgressReporter, TaskStatus};
use crate::task::TaskDescriptor;

/// Reason recorded when a service process goes away before starting
pub const PROCESS_TERMINATED: &str = "Process terminated";

/// Value that becomes available once, to any number of waiters
#[derive(Clone)]
pub struct Promise<T: Clone> {
    inner: Shared<oneshot::Receiver<T>>,
}

impl<T: Clone> Promise<T> {
    /// `None` when the promise was dropped without a value
    pub async fn wait(self) -> Option<T> {
        self.inner.await.ok()
    }

    /// The value, if already settled
    pub fn peek(&self) -> Option<T> {
        self.inner.clone().now_or_never().and_then(Result::ok)
    }
}

/// Settling side of a [`Promise`]; replaced by a fresh one after each settle
pub(crate) struct Deferred<T: Clone> {
    tx: Option<oneshot::Sender<T>>,
    rx: Shared<oneshot::Receiver<T>>,
}

impl<T: Clone> Deferred<T> {
    pub(crate) fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Some(tx),
            rx: rx.shared(),
        }
    }

    pub(crate) fn promise(&self) -> Promise<T> {
        Promise {
            inner: self.rx.clone(),
        }
    }

    pub(crate) fn settle(&mut self, value: T) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(value);
        }
        *self = Self::new();
    }
}

/// Outcome of a start attempt: the running reporter, or why it stopped
pub type StartOutcome = Result<ProgressReporter, String>;

/// What [`ServiceStatus::stop_task`] observed
#[derive(Debug, Clone, PartialEq)]
pub struct StopReport {
    /// Set when the service stopped before its start completed
    pub start_failure: Option<String>,
    /// Error of the reporter, when the run ended in failure
    pub error: Option<String>,
}

/// Current run of a service and the promises tied to its lifecycle
pub struct ServiceStatus {
    task: TaskDescriptor,
    options: ServiceOptions,
    reporter: ProgressReporter,
    worker: Option<Arc<PoolWorker>>,
    spawning: bool,
    started_times: u32,
    stop_call: bool,
    start: Deferred<StartOutcome>,
    stop: Deferred<ProgressReporter>,
}

impl ServiceStatus {
    pub(crate) fn new(task: TaskDescriptor, options: ServiceOptions) -> Self {
        Self {
            reporter: ProgressReporter::new(task.clone()),
            task,
            options,
            worker: None,
            spawning: false,
            started_times: 0,
            stop_call: false,
            start: Deferred::new(),
            stop: Deferred::new(),
        }
    }

    pub fn task(&self) -> &TaskDescriptor {
        &self.task
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    /// Reporter of the latest run
    pub fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    pub fn worker(&self) -> Option<&Arc<PoolWorker>> {
        self.worker.as_ref()
    }

    pub fn is_spawning(&self) -> bool {
        self.spawning
    }

    pub fn started_times(&self) -> u32 {
        self.started_times
    }

    /// A worker is attached and the start was acknowledged
    pub fn is_running(&self) -> bool {
        self.worker.is_some() && !self.spawning
    }

    pub fn start_promise(&self) -> Promise<StartOutcome> {
        self.start.promise()
    }

    pub fn stop_promise(&self) -> Promise<ProgressReporter> {
        self.stop.promise()
    }

    /// Begin a new run with a fresh reporter
    pub(crate) fn generate_progress_reporter(&mut self) -> ProgressReporter {
        self.stop_call = false;
        self.started_times += 1;
        self.spawning = true;
        self.reporter = ProgressReporter::new(self.task.clone());
        self.reporter.clone()
    }

    pub(crate) fn attach_worker(&mut self, worker: Arc<PoolWorker>) {
        self.worker = Some(worker);
    }

    /// The child accepted the task: the run has started
    pub(crate) fn set_worker(&mut self) {
        self.spawning = false;
        self.start.settle(Ok(self.reporter.clone()));
    }

    /// Record the end of the current run
    ///
    /// Returns `None` when the run was already stopped. A run that ends while
    /// still spawning rejects the start promise with the reporter's error, or
    /// with [`PROCESS_TERMINATED`] when the reporter did not fail.
    pub(crate) fn stop_task(&mut self) -> Option<StopReport> {
        if self.stop_call {
            return None;
        }
        self.stop_call = true;

        let error = match self.reporter.status() {
            TaskStatus::Failed => self.reporter.error(),
            _ => None,
        };
        let start_failure = self
            .spawning
            .then(|| error.clone().unwrap_or_else(|| PROCESS_TERMINATED.to_string()));

        self.worker = None;
        self.spawning = false;
        self.stop.settle(self.reporter.clone());
        if let Some(reason) = &start_failure {
            self.start.settle(Err(reason.clone()));
        }

        Some(StopReport { start_failure, error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    fn status() -> ServiceStatus {
        ServiceStatus::new(fixtures::serve("svc", false), ServiceOptions::default())
    }

    #[tokio::test]
    async fn test_promise_is_shared_and_replaced_after_settle() {
        let mut deferred = Deferred::new();
        let first = deferred.promise();
        let second = first.clone();

        deferred.settle(1);
        let next = deferred.promise();
        deferred.settle(2);

        assert_eq!(first.wait().await, Some(1));
        assert_eq!(second.wait().await, Some(1));
        assert_eq!(next.peek(), Some(2));
    }

    #[tokio::test]
    async fn test_dropped_promise_yields_none() {
        let deferred: Deferred<u32> = Deferred::new();
        let promise = deferred.promise();
        drop(deferred);
        assert_eq!(promise.wait().await, None);
    }

    #[tokio::test]
    async fn test_stop_while_spawning_rejects_start_with_reporter_error() {
        let mut status = status();
        let start = status.start_promise();

        let reporter = status.generate_progress_reporter();
        assert!(status.is_spawning());
        assert_eq!(status.started_times(), 1);
        reporter.fail_task("service crashed", None);

        let report = status.stop_task().unwrap();
        assert_eq!(report.start_failure.as_deref(), Some("service crashed"));
        assert_eq!(report.error.as_deref(), Some("service crashed"));
        assert_eq!(start.wait().await.unwrap().unwrap_err(), "service crashed");

        // Stopping twice is a no-op until the next run
        assert!(status.stop_task().is_none());
    }

    #[tokio::test]
    async fn test_stop_after_start_resolves_stop_only() {
        let mut status = status();
        let start = status.start_promise();
        let stop = status.stop_promise();

        status.generate_progress_reporter();
        status.set_worker();
        assert!(!status.is_spawning());
        assert!(start.wait().await.unwrap().is_ok());

        let next_start = status.start_promise();
        let report = status.stop_task().unwrap();
        assert_eq!(report.start_failure, None);
        assert_eq!(stop.wait().await.unwrap().task_id().as_str(), "svc");
        assert!(next_start.peek().is_none());
    }

    #[test]
    fn test_stop_without_failure_reports_process_terminated() {
        let mut status = status();
        status.generate_progress_reporter();
        let report = status.stop_task().unwrap();
        assert_eq!(report.start_failure.as_deref(), Some(PROCESS_TERMINATED));
        assert_eq!(report.error, None);
    }
}
