//! Parent-side handle to one worker process

use foreman_ipc::{handler, methods, IpcError, Messenger, RemoteError};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{ExecutionError, ExecutionResult};
use crate::process::{wait_exit, ProcessControl, ProcessSignal, SpawnedProcess};
use crate::reporter::{ListenerId, ProgressReporter, ReporterSnapshot};
use crate::task::{TaskId, TaskKind};

/// Lifecycle notifications a pool worker sends to its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The last bound task reached a terminal state
    Idle(Uuid),
    /// The worker process is gone
    Exited(Uuid),
}

struct BoundTask {
    reporter: ProgressReporter,
    listener: ListenerId,
    sync: bool,
}

#[derive(Default)]
struct WorkerState {
    tasks: HashMap<TaskId, BoundTask>,
    busy: bool,
    terminated_at: Option<Instant>,
}

/// One spawned process and the reporters of the tasks it currently runs
///
/// Snapshots arriving over `task-report` are merged into the bound reporter,
/// so parent-side listeners observe the child's progress.
pub struct PoolWorker {
    id: Uuid,
    messenger: Messenger,
    process: Arc<dyn ProcessControl>,
    max_jobs: usize,
    state: Mutex<WorkerState>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl PoolWorker {
    /// Wrap a spawned process; `events` receives idle and exit notifications
    pub fn start(
        spawned: SpawnedProcess,
        max_jobs: usize,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Arc<Self> {
        let SpawnedProcess { messenger, process } = spawned;
        let worker = Arc::new(Self {
            id: Uuid::new_v4(),
            messenger,
            process,
            max_jobs: max_jobs.max(1),
            state: Mutex::new(WorkerState::default()),
            events,
        });

        let weak = Arc::downgrade(&worker);
        worker.messenger.register_rpc(
            methods::TASK_REPORT,
            handler(move |payload| {
                let result = match weak.upgrade() {
                    Some(worker) => worker.handle_report(payload),
                    None => Ok(JsonValue::Null),
                };
                async move { result }
            }),
        );

        tokio::spawn(monitor_exit(Arc::downgrade(&worker), worker.messenger.clone(), worker.process.clone()));

        debug!(worker_id = %worker.id, pid = ?worker.process.pid(), "Pool worker started");
        worker
    }

    fn state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// RPC connection to the child, used to reach IPC service methods
    pub fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    fn handle_report(&self, payload: JsonValue) -> Result<JsonValue, RemoteError> {
        let snapshot: ReporterSnapshot = serde_json::from_value(payload)
            .map_err(|e| RemoteError::new(format!("invalid task report: {}", e)))?;

        let reporter = self
            .state()
            .tasks
            .get(snapshot.task_id())
            .map(|bound| bound.reporter.clone());

        match reporter {
            Some(reporter) => {
                if let Err(e) = reporter.merge(&snapshot) {
                    warn!(worker_id = %self.id, "Rejected task report: {}", e);
                    return Err(RemoteError::new(e.to_string()));
                }
                // Cancellation settles the reporter without an event
                if reporter.is_terminal() {
                    self.release(snapshot.task_id());
                }
            }
            None => trace!(worker_id = %self.id, task_id = %snapshot.task_id(), "Report for unbound task"),
        }
        Ok(JsonValue::Null)
    }

    pub fn task_count(&self) -> usize {
        self.state().tasks.len()
    }

    /// Whether a sync task runs here or the job ceiling is reached
    pub fn is_busy(&self) -> bool {
        let state = self.state();
        state.busy || state.tasks.len() >= self.max_jobs
    }

    pub fn is_terminated(&self) -> bool {
        self.state().terminated_at.is_some()
    }

    /// Sync tasks need an empty worker, async tasks a worker that is not busy
    pub fn can_accept(&self, kind: TaskKind) -> bool {
        let state = self.state();
        if state.terminated_at.is_some() {
            return false;
        }
        if kind.is_loop_aware() {
            !state.busy && state.tasks.len() < self.max_jobs
        } else {
            state.tasks.is_empty()
        }
    }

    /// Reporters of the tasks currently bound to this worker
    pub fn reporters(&self) -> Vec<ProgressReporter> {
        self.state()
            .tasks
            .values()
            .map(|bound| bound.reporter.clone())
            .collect()
    }

    /// Reserve a slot for the reporter's task
    ///
    /// The slot is released when the reporter reaches a terminal state.
    pub fn bind(self: &Arc<Self>, reporter: &ProgressReporter) -> ExecutionResult<()> {
        let task_id = reporter.task_id();
        let kind = reporter.task().kind;

        if reporter.is_terminal() {
            return Err(ExecutionError::InvalidState(format!(
                "task {} is already finished",
                task_id
            )));
        }

        let mut state = self.state();
        if state.terminated_at.is_some() {
            return Err(ExecutionError::InvalidState("worker is terminating".to_string()));
        }
        if state.tasks.contains_key(&task_id) {
            return Err(ExecutionError::InvalidState(format!(
                "task {} is already bound to this worker",
                task_id
            )));
        }
        let fits = if kind.is_loop_aware() {
            !state.busy && state.tasks.len() < self.max_jobs
        } else {
            state.tasks.is_empty()
        };
        if !fits {
            return Err(ExecutionError::NoCapacity);
        }

        let weak = Arc::downgrade(self);
        let listener = reporter.subscribe(move |_, reporter| {
            if reporter.is_terminal() {
                if let Some(worker) = weak.upgrade() {
                    worker.release(&reporter.task_id());
                }
            }
        });

        let sync = !kind.is_loop_aware();
        if sync {
            state.busy = true;
        }
        state.tasks.insert(
            task_id,
            BoundTask {
                reporter: reporter.clone(),
                listener,
                sync,
            },
        );
        Ok(())
    }

    /// Drop a bound task; emits [`WorkerEvent::Idle`] when none remain
    fn release(&self, task_id: &TaskId) -> bool {
        let idle = {
            let mut state = self.state();
            let Some(bound) = state.tasks.remove(task_id) else {
                return false;
            };
            bound.reporter.unsubscribe(bound.listener);
            if bound.sync {
                state.busy = state.tasks.values().any(|task| task.sync);
            }
            state.tasks.is_empty() && state.terminated_at.is_none()
        };

        if idle {
            let _ = self.events.send(WorkerEvent::Idle(self.id));
        }
        true
    }

    /// Send a bound task to the child
    ///
    /// A child that rejects the task fails the reporter and the call succeeds;
    /// a transport failure unbinds the task and is returned to the caller. A
    /// child that does not acknowledge in time is killed.
    pub async fn dispatch(&self, reporter: &ProgressReporter) -> ExecutionResult<()> {
        let task_id = reporter.task_id();
        let sent = match serde_json::to_value(reporter.task()) {
            Ok(payload) => self.messenger.rpc(methods::SUBMIT_TASK, payload).await,
            Err(e) => Err(IpcError::from(e)),
        };

        match sent {
            Ok(_) => {
                debug!(worker_id = %self.id, task_id = %task_id, "Task submitted");
                Ok(())
            }
            Err(IpcError::Remote(e)) => {
                info!(worker_id = %self.id, task_id = %task_id, "Worker rejected task: {}", e);
                reporter.fail_task(e.message, None);
                Ok(())
            }
            Err(e) => {
                if reporter.is_terminal() {
                    return Ok(());
                }
                if matches!(e, IpcError::Timeout { .. }) {
                    warn!(worker_id = %self.id, task_id = %task_id, "Killing unresponsive worker: {}", e);
                    self.request_terminate();
                    if let Err(kill) = self.signal(ProcessSignal::Kill) {
                        warn!(worker_id = %self.id, "Failed to kill worker: {}", kill);
                    }
                }
                self.release(&task_id);
                Err(ExecutionError::Transport(e))
            }
        }
    }

    /// Ask the child to stop; only the first call sends the request
    pub fn request_terminate(&self) -> bool {
        {
            let mut state = self.state();
            if state.terminated_at.is_some() {
                return false;
            }
            state.terminated_at = Some(Instant::now());
        }

        debug!(worker_id = %self.id, "Requesting worker termination");
        if let Err(e) = self.messenger.terminate() {
            debug!(worker_id = %self.id, "Terminate request not sent: {}", e);
        }
        true
    }

    /// When [`request_terminate`](Self::request_terminate) was first called
    pub fn termination_timestamp(&self) -> Option<Instant> {
        self.state().terminated_at
    }

    pub fn signal(&self, signal: ProcessSignal) -> ExecutionResult<()> {
        self.process.signal(signal)
    }

    pub fn has_exited(&self) -> bool {
        self.process.has_exited()
    }

    pub async fn wait_exit(&self) {
        wait_exit(self.process.as_ref()).await;
    }

    /// Fail every bound task once the connection to the child is gone
    fn fail_bound_tasks(&self) {
        let reporters: Vec<ProgressReporter> = {
            let mut state = self.state();
            state.terminated_at.get_or_insert_with(Instant::now);
            state
                .tasks
                .values()
                .map(|bound| bound.reporter.clone())
                .collect()
        };

        for reporter in reporters {
            warn!(worker_id = %self.id, task_id = %reporter.task_id(), "Worker process exited with task bound");
            reporter.fail_task("worker process exited", None);
        }
    }
}

async fn monitor_exit(worker: Weak<PoolWorker>, messenger: Messenger, process: Arc<dyn ProcessControl>) {
    // The connection closes after every frame the child sent has been handled
    messenger.closed().await;
    if let Some(worker) = worker.upgrade() {
        worker.fail_bound_tasks();
    }

    wait_exit(process.as_ref()).await;
    if let Some(worker) = worker.upgrade() {
        debug!(worker_id = %worker.id, "Worker process exited");
        let _ = worker.events.send(WorkerEvent::Exited(worker.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::reporter::TaskStatus;
    use foreman_ipc::memory_pair;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::watch;

    /// Process handle that only records signals; kill marks it exited
    struct RecordingProcess {
        signals: Mutex<Vec<ProcessSignal>>,
        exited: watch::Sender<bool>,
    }

    impl ProcessControl for RecordingProcess {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn signal(&self, signal: ProcessSignal) -> ExecutionResult<()> {
            self.signals.lock().unwrap().push(signal);
            if signal == ProcessSignal::Kill {
                self.exited.send_replace(true);
            }
            Ok(())
        }

        fn exit_watch(&self) -> watch::Receiver<bool> {
            self.exited.subscribe()
        }
    }

    async fn start_worker(max_jobs: usize) -> (Arc<PoolWorker>, mpsc::UnboundedReceiver<WorkerEvent>) {
        let spawned = fixtures::local_processes().spawn().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (PoolWorker::start(spawned, max_jobs, tx), rx)
    }

    async fn settle(reporter: &ProgressReporter) {
        tokio::time::timeout(Duration::from_secs(5), reporter.wait_terminal())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_async_task_result_is_merged() {
        let (worker, mut events) = start_worker(2).await;
        let reporter = ProgressReporter::new(fixtures::sleep("a", 10, json!("first")));

        worker.bind(&reporter).unwrap();
        assert_eq!(worker.task_count(), 1);
        assert!(!worker.is_busy());
        worker.dispatch(&reporter).await.unwrap();

        settle(&reporter).await;
        assert_eq!(reporter.status(), TaskStatus::Completed);
        assert_eq!(reporter.result(), Some(json!("first")));
        assert_eq!(reporter.completion(), 100.0);
        assert_eq!(worker.task_count(), 0);
        assert_eq!(events.recv().await, Some(WorkerEvent::Idle(worker.id())));
    }

    #[tokio::test]
    async fn test_admission_rules() {
        let (worker, _events) = start_worker(2).await;

        let first = ProgressReporter::new(fixtures::sleep("a", 200, json!(1)));
        let second = ProgressReporter::new(fixtures::sleep("b", 200, json!(2)));
        worker.bind(&first).unwrap();
        assert!(!worker.can_accept(TaskKind::Sync));
        assert!(worker.can_accept(TaskKind::Async));

        worker.bind(&second).unwrap();
        assert!(worker.is_busy());
        let third = ProgressReporter::new(fixtures::sleep("c", 10, json!(3)));
        assert!(matches!(worker.bind(&third), Err(ExecutionError::NoCapacity)));
    }

    #[tokio::test]
    async fn test_sync_task_marks_worker_busy() {
        let (worker, _events) = start_worker(4).await;
        let reporter = ProgressReporter::new(fixtures::hold("s", 50));

        worker.bind(&reporter).unwrap();
        assert!(worker.is_busy());
        assert!(!worker.can_accept(TaskKind::Async));
        worker.dispatch(&reporter).await.unwrap();

        settle(&reporter).await;
        assert_eq!(reporter.result(), Some(json!("held")));
        assert!(!worker.is_busy());
        assert!(worker.can_accept(TaskKind::Sync));
    }

    #[tokio::test]
    async fn test_failed_task_releases_slot() {
        let (worker, _events) = start_worker(4).await;
        let reporter = ProgressReporter::new(fixtures::fail("f", "error message"));

        worker.bind(&reporter).unwrap();
        worker.dispatch(&reporter).await.unwrap();
        settle(&reporter).await;

        assert_eq!(reporter.status(), TaskStatus::Failed);
        assert!(reporter.error().unwrap().contains("error message"));
        assert_eq!(worker.task_count(), 0);
        assert_eq!(reporter.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_report_releases_slot() {
        let (worker, mut events) = start_worker(1).await;
        let reporter = ProgressReporter::new(fixtures::sleep("c", 10, json!(null)));
        worker.bind(&reporter).unwrap();
        assert!(!worker.can_accept(TaskKind::Async));

        let mut cancelled = reporter.snapshot();
        cancelled.status = TaskStatus::Cancelled;
        cancelled.revision += 1;
        worker.handle_report(serde_json::to_value(&cancelled).unwrap()).unwrap();

        assert_eq!(reporter.status(), TaskStatus::Cancelled);
        assert_eq!(worker.task_count(), 0);
        assert_eq!(reporter.listener_count(), 0);
        assert!(worker.can_accept(TaskKind::Async));
        assert_eq!(events.recv().await, Some(WorkerEvent::Idle(worker.id())));
    }

    #[tokio::test]
    async fn test_rejected_task_fails_reporter() {
        let (worker, _events) = start_worker(4).await;
        let mut descriptor = fixtures::sleep("x", 10, json!(null));
        descriptor.task_type = "unregistered".to_string();
        let reporter = ProgressReporter::new(descriptor);

        worker.bind(&reporter).unwrap();
        worker.dispatch(&reporter).await.unwrap();

        assert_eq!(reporter.status(), TaskStatus::Failed);
        assert!(reporter.error().unwrap().contains("unknown task type"));
        assert_eq!(worker.task_count(), 0);
    }

    #[tokio::test]
    async fn test_unacknowledged_dispatch_kills_worker() {
        let (parent_side, child_side) = memory_pair();
        let child = Messenger::spawn(child_side);
        child.register_rpc(
            methods::SUBMIT_TASK,
            handler(|_| async {
                futures::future::pending::<()>().await;
                Ok(JsonValue::Null)
            }),
        );

        let process = Arc::new(RecordingProcess {
            signals: Mutex::new(Vec::new()),
            exited: watch::Sender::new(false),
        });
        let spawned = SpawnedProcess {
            messenger: Messenger::spawn_with_timeout(parent_side, Duration::from_millis(100)),
            process: process.clone(),
        };
        let (tx, _events) = mpsc::unbounded_channel();
        let worker = PoolWorker::start(spawned, 2, tx);

        let reporter = ProgressReporter::new(fixtures::sleep("wedged", 10, json!(null)));
        worker.bind(&reporter).unwrap();
        let err = tokio::time::timeout(Duration::from_secs(2), worker.dispatch(&reporter))
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, ExecutionError::Transport(IpcError::Timeout { .. })));
        assert_eq!(reporter.status(), TaskStatus::Processing);
        assert_eq!(worker.task_count(), 0);
        assert!(worker.is_terminated());
        assert!(!worker.can_accept(TaskKind::Async));
        assert_eq!(*process.signals.lock().unwrap(), vec![ProcessSignal::Kill]);
    }

    #[tokio::test]
    async fn test_process_exit_fails_bound_tasks() {
        let (worker, mut events) = start_worker(4).await;
        let reporter = ProgressReporter::new(fixtures::sleep("long", 60_000, json!(null)));
        worker.bind(&reporter).unwrap();
        worker.dispatch(&reporter).await.unwrap();

        worker.signal(ProcessSignal::Kill).unwrap();
        settle(&reporter).await;
        assert_eq!(reporter.error().as_deref(), Some("worker process exited"));

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv()).await.unwrap();
        assert_eq!(event, Some(WorkerEvent::Exited(worker.id())));
        assert!(worker.has_exited());
        assert!(!worker.can_accept(TaskKind::Async));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let (worker, mut events) = start_worker(1).await;

        assert!(worker.termination_timestamp().is_none());
        assert!(worker.request_terminate());
        let first = worker.termination_timestamp().unwrap();
        assert!(!worker.request_terminate());
        assert_eq!(worker.termination_timestamp(), Some(first));

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv()).await.unwrap();
        assert_eq!(event, Some(WorkerEvent::Exited(worker.id())));
    }
}
