//! Supervision of long-running service tasks
//!
//! Every registered service runs alone in its own worker process. A periodic
//! check spawns services that are not running, restarts stopped ones
//! according to their [`RestartPolicy`] and escalates termination of workers
//! that do not exit in time: first the terminate signal, then the kill signal.

pub mod status;

pub use status::{Promise, ServiceStatus, StartOutcome, StopReport, PROCESS_TERMINATED};

use foreman_config::{ForemanConfig, RestartPolicy, ServiceConfig, ServiceOptions};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ExecutionError, ExecutionResult};
use crate::pool_worker::{PoolWorker, WorkerEvent};
use crate::process::{CommandLauncher, ProcessCollection, ProcessSignal};
use crate::reporter::{ProgressReporter, TaskStatus};
use crate::task::{TaskDescriptor, TaskId};

use status::Deferred;

const EVENT_CAPACITY: usize = 64;

/// Service lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    Started(TaskId),
    Stopped(TaskId),
    /// Not emitted for services with [`RestartPolicy::NeverSilent`]
    Failed { task_id: TaskId, error: String },
}

/// Point-in-time view of a registered service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub task: TaskDescriptor,
    pub status: TaskStatus,
    pub message: String,
    pub error: Option<String>,
    pub running: bool,
    pub spawning: bool,
    pub started_times: u32,
    pub pid: Option<u32>,
    pub restart_policy: RestartPolicy,
}

impl ServiceInfo {
    fn of(status: &ServiceStatus) -> Self {
        let reporter = status.reporter();
        Self {
            task: status.task().clone(),
            status: reporter.status(),
            message: reporter.message(),
            error: reporter.error(),
            running: status.is_running(),
            spawning: status.is_spawning(),
            started_times: status.started_times(),
            pid: status.worker().and_then(|worker| worker.pid()),
            restart_policy: status.options().restart_policy,
        }
    }
}

/// Pending start of a service
pub struct ServiceStart {
    task_id: TaskId,
    promise: Promise<StartOutcome>,
}

impl std::fmt::Debug for ServiceStart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceStart")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

impl ServiceStart {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Resolves with the running reporter, or the reason the start failed
    pub async fn wait(self) -> ExecutionResult<ProgressReporter> {
        match self.promise.wait().await {
            Some(Ok(reporter)) => Ok(reporter),
            Some(Err(reason)) => Err(ExecutionError::ServiceFailed(reason)),
            None => Err(ExecutionError::Cancelled),
        }
    }
}

#[derive(Default)]
struct ServiceTable {
    order: Vec<TaskId>,
    services: HashMap<TaskId, ServiceStatus>,
    draining: bool,
    drained: Option<Deferred<()>>,
}

impl ServiceTable {
    fn by_worker(&mut self, worker_id: Uuid) -> Option<&mut ServiceStatus> {
        self.services
            .values_mut()
            .find(|status| status.worker().map(|worker| worker.id()) == Some(worker_id))
    }

    fn get(&self, task_id: &TaskId) -> ExecutionResult<&ServiceStatus> {
        self.services
            .get(task_id)
            .ok_or_else(|| ExecutionError::UnknownService(task_id.clone()))
    }
}

struct ServiceInner {
    config: ServiceConfig,
    processes: ProcessCollection,
    table: Mutex<ServiceTable>,
    worker_events: mpsc::UnboundedSender<WorkerEvent>,
    events: broadcast::Sender<ServiceEvent>,
    wake: Notify,
}

impl ServiceInner {
    fn table(&self) -> MutexGuard<'_, ServiceTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One supervision pass; returns false once draining has finished
    fn check_services(self: &Arc<Self>) -> bool {
        let mut table = self.table();
        let draining = table.draining;
        let mut active = false;

        let ids = table.order.clone();
        for task_id in ids {
            let Some(status) = table.services.get_mut(&task_id) else {
                continue;
            };
            if status.is_spawning() {
                active = true;
                continue;
            }

            if !draining {
                let restarts = status.options().restart_policy.restarts();
                if status.started_times() > 0 && !restarts && status.worker().is_none() {
                    continue;
                }
                if let Some(worker) = status.worker() {
                    if worker.task_count() == 1 && !status.reporter().is_terminal() {
                        continue;
                    }
                }
            }

            if let Some(worker) = status.worker() {
                active = true;
                escalate_termination(worker, status.options());
                continue;
            }

            if !draining {
                active = true;
                let reporter = status.generate_progress_reporter();
                debug!(task_id = %task_id, attempt = status.started_times(), "Spawning service");
                tokio::spawn(spawn_service(Arc::downgrade(self), task_id, reporter));
            }
        }

        if draining && !active {
            if let Some(mut drained) = table.drained.take() {
                drained.settle(());
            }
            info!("All services stopped");
            return false;
        }
        true
    }

    fn on_worker_idle(&self, worker_id: Uuid) {
        let mut table = self.table();
        if let Some(status) = table.by_worker(worker_id) {
            debug!(task_id = %status.task().id, "Service task ended, stopping its worker");
            if let Some(worker) = status.worker() {
                worker.request_terminate();
            }
        }
    }

    fn on_worker_exited(&self, worker_id: Uuid) {
        let event = {
            let mut table = self.table();
            let draining = table.draining;
            let event = table.by_worker(worker_id).and_then(record_stop);
            if draining {
                self.wake.notify_one();
            }
            event
        };
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }

    fn stop_run(&self, task_id: &TaskId, reporter: &ProgressReporter) {
        let event = {
            let mut table = self.table();
            match table.services.get_mut(task_id) {
                Some(status) if status.reporter().ptr_eq(reporter) => record_stop(status),
                _ => None,
            }
        };
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }
}

/// Ask the worker to stop, then signal it once the grace periods pass
fn escalate_termination(worker: &PoolWorker, options: &ServiceOptions) {
    let Some(requested) = worker.termination_timestamp() else {
        worker.request_terminate();
        return;
    };

    let elapsed = requested.elapsed();
    if elapsed <= options.terminate_timeout {
        return;
    }
    let signal = if elapsed > options.terminate_timeout_hard {
        ProcessSignal::Kill
    } else {
        ProcessSignal::Terminate
    };
    debug!(worker_id = %worker.id(), ?signal, "Service worker did not exit in time");
    if let Err(e) = worker.signal(signal) {
        warn!(worker_id = %worker.id(), "Failed to signal service worker: {}", e);
    }
}

fn record_stop(status: &mut ServiceStatus) -> Option<ServiceEvent> {
    let report = status.stop_task()?;
    let task_id = status.task().id.clone();
    let silent = status.options().restart_policy == RestartPolicy::NeverSilent;

    match report.start_failure.or(report.error) {
        Some(error) if !silent => {
            warn!(task_id = %task_id, "Service failed: {}", error);
            Some(ServiceEvent::Failed { task_id, error })
        }
        _ => {
            info!(task_id = %task_id, "Service stopped");
            Some(ServiceEvent::Stopped(task_id))
        }
    }
}

async fn spawn_service(inner: Weak<ServiceInner>, task_id: TaskId, reporter: ProgressReporter) {
    let Some(this) = inner.upgrade() else {
        return;
    };

    let spawned = match this.processes.spawn().await {
        Ok(spawned) => spawned,
        Err(e) => {
            warn!(task_id = %task_id, "Failed to spawn service process: {}", e);
            reporter.fail_task(e.to_string(), None);
            this.stop_run(&task_id, &reporter);
            return;
        }
    };

    // Exit events are handled under the table lock, so attach before they can be
    let (worker, draining) = {
        let mut table = this.table();
        let worker = PoolWorker::start(spawned, 1, this.worker_events.clone());
        if let Some(status) = table.services.get_mut(&task_id) {
            status.attach_worker(worker.clone());
        }
        (worker, table.draining)
    };
    if draining {
        worker.request_terminate();
        return;
    }

    let dispatched = match worker.bind(&reporter) {
        Ok(()) => worker.dispatch(&reporter).await,
        Err(e) => Err(e),
    };
    if let Err(e) = dispatched {
        warn!(task_id = %task_id, "Failed to start service: {}", e);
        reporter.fail_task(e.to_string(), None);
        worker.request_terminate();
        return;
    }

    // Failing before the acknowledgement rejects the start once the worker exits
    if reporter.is_terminal() {
        worker.request_terminate();
        return;
    }

    let started = {
        let mut table = this.table();
        match table.services.get_mut(&task_id) {
            Some(status) if status.is_spawning() && status.reporter().ptr_eq(&reporter) => {
                status.set_worker();
                true
            }
            _ => false,
        }
    };
    if started {
        info!(task_id = %task_id, pid = ?worker.pid(), "Service started");
        let _ = this.events.send(ServiceEvent::Started(task_id));
    }
}

async fn check_loop(inner: Arc<ServiceInner>) {
    let mut ticker = tokio::time::interval(inner.config.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = inner.wake.notified() => {}
        }
        if !inner.check_services() {
            break;
        }
    }
}

async fn watch_workers(inner: Weak<ServiceInner>, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            WorkerEvent::Idle(worker_id) => inner.on_worker_idle(worker_id),
            WorkerEvent::Exited(worker_id) => inner.on_worker_exited(worker_id),
        }
    }
}

/// Keeps registered service tasks running, each in a dedicated worker
pub struct ServiceManager {
    inner: Arc<ServiceInner>,
    checker: Mutex<Option<JoinHandle<()>>>,
    watcher: JoinHandle<()>,
}

impl ServiceManager {
    pub fn new(config: &ServiceConfig, processes: ProcessCollection) -> Self {
        let (worker_events, events_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(ServiceInner {
            config: config.clone(),
            processes,
            table: Mutex::new(ServiceTable::default()),
            worker_events,
            events,
            wake: Notify::new(),
        });
        let watcher = tokio::spawn(watch_workers(Arc::downgrade(&inner), events_rx));

        Self {
            inner,
            checker: Mutex::new(None),
            watcher,
        }
    }

    /// Manager spawning workers with the configured worker command
    pub fn from_config(config: &ForemanConfig) -> ExecutionResult<Self> {
        let launcher = CommandLauncher::from_config(&config.process)?;
        let processes = ProcessCollection::single(Arc::new(launcher), config.pool.spawn_attempts);
        Ok(Self::new(&config.service, processes))
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Register a service with the default options
    pub fn add_task(&self, task: TaskDescriptor) -> ExecutionResult<ServiceStart> {
        let options = self.inner.config.defaults.clone();
        self.add_task_with_options(task, options)
    }

    pub fn add_task_with_options(
        &self,
        task: TaskDescriptor,
        options: ServiceOptions,
    ) -> ExecutionResult<ServiceStart> {
        if !task.is_service() {
            return Err(ExecutionError::NotAService(task.id));
        }

        let task_id = task.id.clone();
        let promise = {
            let mut table = self.inner.table();
            if table.services.contains_key(&task_id) {
                return Err(ExecutionError::DuplicateService(task_id));
            }
            let status = ServiceStatus::new(task, options);
            let promise = status.start_promise();
            table.order.push(task_id.clone());
            table.services.insert(task_id.clone(), status);
            promise
        };

        debug!(task_id = %task_id, "Service registered");
        self.inner.wake.notify_one();
        Ok(ServiceStart { task_id, promise })
    }

    /// Start supervising; resolves once every registered service settled its start
    pub async fn start(&self) -> Vec<(TaskId, ExecutionResult<ProgressReporter>)> {
        let pending: Vec<(TaskId, Option<ProgressReporter>, ServiceStart)> = {
            let table = self.inner.table();
            table
                .order
                .iter()
                .filter_map(|task_id| table.services.get(task_id))
                .map(|status| {
                    let task_id = status.task().id.clone();
                    let running = status.is_running().then(|| status.reporter().clone());
                    let start = ServiceStart {
                        task_id: task_id.clone(),
                        promise: status.start_promise(),
                    };
                    (task_id, running, start)
                })
                .collect()
        };

        self.ensure_checker();

        join_all(pending.into_iter().map(|(task_id, running, start)| async move {
            let outcome = match running {
                Some(reporter) => Ok(reporter),
                None => start.wait().await,
            };
            (task_id, outcome)
        }))
        .await
    }

    fn ensure_checker(&self) {
        let mut checker = self
            .checker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if checker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *checker = Some(tokio::spawn(check_loop(self.inner.clone())));
    }

    /// Stop every service and stop restarting them
    ///
    /// Resolves once no service has a worker left.
    pub async fn terminate(&self) {
        let drained = {
            let mut table = self.inner.table();
            table.draining = true;
            table.drained.get_or_insert_with(Deferred::new).promise()
        };
        info!("Terminating services");
        self.ensure_checker();
        self.inner.wake.notify_one();
        drained.wait().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    /// Registered service tasks, in registration order
    pub fn tasks(&self) -> Vec<TaskDescriptor> {
        let table = self.inner.table();
        table
            .order
            .iter()
            .filter_map(|task_id| table.services.get(task_id))
            .map(|status| status.task().clone())
            .collect()
    }

    pub fn task_by_id(&self, task_id: &TaskId) -> ExecutionResult<TaskDescriptor> {
        Ok(self.inner.table().get(task_id)?.task().clone())
    }

    pub fn status_by_id(&self, task_id: &TaskId) -> ExecutionResult<ServiceInfo> {
        Ok(ServiceInfo::of(self.inner.table().get(task_id)?))
    }

    pub fn statuses(&self) -> Vec<ServiceInfo> {
        let table = self.inner.table();
        table
            .order
            .iter()
            .filter_map(|task_id| table.services.get(task_id))
            .map(ServiceInfo::of)
            .collect()
    }

    /// Resolves with the reporter of the run when the service next stops
    pub fn stop_signal(&self, task_id: &TaskId) -> ExecutionResult<Promise<ProgressReporter>> {
        Ok(self.inner.table().get(task_id)?.stop_promise())
    }

    /// Resolves when the service next starts, or fails to
    pub fn start_signal(&self, task_id: &TaskId) -> ExecutionResult<ServiceStart> {
        let promise = self.inner.table().get(task_id)?.start_promise();
        Ok(ServiceStart {
            task_id: task_id.clone(),
            promise,
        })
    }

    /// Call a method exposed by a running IPC service
    pub async fn call(&self, task_id: &TaskId, method: &str, payload: JsonValue) -> ExecutionResult<JsonValue> {
        let worker = {
            let table = self.inner.table();
            let status = table.get(task_id)?;
            if !status.task().is_ipc_capable() {
                return Err(ExecutionError::NotIpcCapable(task_id.clone()));
            }
            match status.worker() {
                Some(worker) if status.is_running() => worker.clone(),
                _ => return Err(ExecutionError::ServiceNotRunning(task_id.clone())),
            }
        };
        Ok(worker.messenger().rpc(method, payload).await?)
    }
}

impl Drop for ServiceManager {
    fn drop(&mut self) {
        if let Some(checker) = self
            .checker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            checker.abort();
        }
        self.watcher.abort();
    }
}
