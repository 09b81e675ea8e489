//! Task manager: drains a task queue into the worker pool
//!
//! The manager polls the queue on the idle interval while nothing is pending
//! and on the busy interval while tasks wait for pool capacity. Every
//! dequeued task gets a [`ProgressReporter`]; its events are persisted,
//! republished as [`ManagerEvent`]s and reconciled with the queue, in the
//! order they were emitted.

use foreman_config::{ForemanConfig, ManagerConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ExecutionError, ExecutionResult};
use crate::pool::{PoolStats, WorkerPool};
use crate::process::{CommandLauncher, ProcessCollection};
use crate::queue::{QueueStats, TaskQueue};
use crate::reporter::{ListenerId, ProgressReporter, ReporterEvent, ReporterSnapshot};
use crate::storage::TaskStorage;
use crate::task::{TaskDescriptor, TaskId};

const EVENT_CAPACITY: usize = 256;

/// Task lifecycle notifications published by the manager
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    TaskProgress(ReporterSnapshot),
    TaskCompleted(ReporterSnapshot),
    TaskFailed(ReporterSnapshot),
}

impl ManagerEvent {
    pub fn snapshot(&self) -> &ReporterSnapshot {
        match self {
            ManagerEvent::TaskProgress(snapshot)
            | ManagerEvent::TaskCompleted(snapshot)
            | ManagerEvent::TaskFailed(snapshot) => snapshot,
        }
    }
}

/// Combined pool and queue statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStats {
    pub pool: PoolStats,
    pub queue: QueueStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollMode {
    Idle,
    Busy,
}

enum Tick {
    /// A task went to the pool; check again right away
    Dispatched,
    Mode(PollMode),
    Unchanged,
}

type Waiter = (u64, oneshot::Sender<ProgressReporter>);

struct ManagerInner {
    config: ManagerConfig,
    queue: Arc<dyn TaskQueue>,
    pool: WorkerPool,
    storage: Option<Arc<dyn TaskStorage>>,
    waiters: Mutex<HashMap<TaskId, Vec<Waiter>>>,
    next_waiter: AtomicU64,
    events: broadcast::Sender<ManagerEvent>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
}

impl ManagerInner {
    fn waiters(&self) -> MutexGuard<'_, HashMap<TaskId, Vec<Waiter>>> {
        self.waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn check_queue(self: &Arc<Self>) -> Tick {
        let pending = match self.queue.count().await {
            Ok(count) => count,
            Err(e) => {
                warn!("Failed to count queued tasks: {}", e);
                return Tick::Unchanged;
            }
        };

        if !self.pool.can_process_async_task() && pending > 0 {
            self.pool.ping();
            return Tick::Mode(PollMode::Busy);
        }

        let async_only = !self.pool.can_process_sync_task();
        match self.queue.dequeue(async_only).await {
            Ok(Some(task)) => {
                if self.handle_task(task).await {
                    Tick::Dispatched
                } else {
                    Tick::Mode(PollMode::Busy)
                }
            }
            Ok(None) if async_only && pending > 0 => {
                // Only sync tasks are left and every worker has work
                self.pool.ping();
                Tick::Mode(PollMode::Busy)
            }
            Ok(None) => Tick::Mode(PollMode::Idle),
            Err(e) => {
                warn!("Failed to dequeue task: {}", e);
                Tick::Unchanged
            }
        }
    }

    /// Bind a reporter to the task and submit it; false if it was refunded
    async fn handle_task(self: &Arc<Self>, task: TaskDescriptor) -> bool {
        let task_id = task.id.clone();
        let reporter = ProgressReporter::new(task.clone());

        // Counters first: waiters resolved by reconcile read them
        let stats = self.pool.track(&reporter);
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = reporter.subscribe(move |event, reporter| {
            let _ = tx.send((event, reporter.snapshot()));
        });
        tokio::spawn(reconcile(Arc::downgrade(self), reporter.clone(), listener, rx));

        match self.pool.submit_tracked(&reporter).await {
            Ok(()) => {
                debug!(task_id = %task_id, "Task dispatched");
                true
            }
            Err(e) if reporter.is_terminal() => {
                debug!(task_id = %task_id, "Task settled during dispatch: {}", e);
                true
            }
            Err(e) => {
                if e.is_dispatch_failure() {
                    info!(task_id = %task_id, "Task returned to queue: {}", e);
                } else {
                    warn!(task_id = %task_id, "Task returned to queue after unexpected error: {}", e);
                }
                reporter.unsubscribe(listener);
                reporter.unsubscribe(stats);
                if let Err(e) = self.queue.refund(task).await {
                    warn!(task_id = %task_id, "Failed to refund task: {}", e);
                }
                false
            }
        }
    }

    async fn store(&self, snapshot: &ReporterSnapshot) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.update(snapshot).await {
                warn!(task_id = %snapshot.task.id, "Failed to store task state: {}", e);
            }
        }
    }

    fn publish(&self, event: ManagerEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    fn resolve_waiters(&self, reporter: &ProgressReporter) {
        let waiters = self.waiters().remove(&reporter.task_id()).unwrap_or_default();
        for (_, waiter) in waiters {
            let _ = waiter.send(reporter.clone());
        }
    }
}

/// Apply one task's reporter events in emission order
async fn reconcile(
    inner: Weak<ManagerInner>,
    reporter: ProgressReporter,
    listener: ListenerId,
    mut events: mpsc::UnboundedReceiver<(ReporterEvent, ReporterSnapshot)>,
) {
    while let Some((event, snapshot)) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let task_id = snapshot.task.id.clone();

        match event {
            ReporterEvent::Change => {
                inner.store(&snapshot).await;
                inner.publish(ManagerEvent::TaskProgress(snapshot));
            }
            ReporterEvent::Done => {
                if let Err(e) = inner.queue.complete(&task_id).await {
                    warn!(task_id = %task_id, "Failed to complete task in queue: {}", e);
                }
                inner.store(&snapshot).await;
                inner.publish(ManagerEvent::TaskCompleted(snapshot));
                inner.resolve_waiters(&reporter);
                break;
            }
            ReporterEvent::Failed => {
                if let Err(e) = inner.queue.fail(&task_id).await {
                    warn!(task_id = %task_id, "Failed to mark task failed in queue: {}", e);
                }
                inner.store(&snapshot).await;
                inner.publish(ManagerEvent::TaskFailed(snapshot));
                inner.resolve_waiters(&reporter);
                break;
            }
        }
    }
    reporter.unsubscribe(listener);
}

async fn poll_loop(inner: Arc<ManagerInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut mode = PollMode::Idle;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match inner.check_queue().await {
            Tick::Dispatched => continue,
            Tick::Mode(next) => {
                if next != mode {
                    debug!(?next, "Switching queue poll mode");
                }
                mode = next;
            }
            Tick::Unchanged => {}
        }

        let interval = match mode {
            PollMode::Idle => inner.config.idle_poll_interval,
            PollMode::Busy => inner.config.busy_poll_interval,
        };

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = inner.wake.notified() => {}
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
        }
    }
    debug!("Queue polling stopped");
}

/// Handle to a task submitted through [`TaskManager::submit_task`]
pub struct SubmittedTask {
    task_id: TaskId,
    waiter: u64,
    receiver: oneshot::Receiver<ProgressReporter>,
    manager: Weak<ManagerInner>,
}

impl SubmittedTask {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Resolve with the task's reporter once it completed or failed
    ///
    /// Fails with [`ExecutionError::Cancelled`] if the task was cancelled or
    /// the manager terminated before the task ran.
    pub async fn wait(self) -> ExecutionResult<ProgressReporter> {
        self.receiver.await.map_err(|_| ExecutionError::Cancelled)
    }

    /// Cancel the task if it has not been dequeued yet
    pub async fn cancel(&self) -> ExecutionResult<()> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| ExecutionError::InvalidState("task manager is gone".to_string()))?;
        manager.queue.cancel(&self.task_id).await?;

        let mut waiters = manager.waiters();
        if let Some(list) = waiters.get_mut(&self.task_id) {
            list.retain(|(id, _)| *id != self.waiter);
            if list.is_empty() {
                waiters.remove(&self.task_id);
            }
        }
        Ok(())
    }
}

/// Feeds queued tasks to a worker pool
pub struct TaskManager {
    inner: Arc<ManagerInner>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl TaskManager {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        pool: WorkerPool,
        storage: Option<Arc<dyn TaskStorage>>,
        config: &ManagerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(ManagerInner {
            config: config.clone(),
            queue,
            pool,
            storage,
            waiters: Mutex::new(HashMap::new()),
            next_waiter: AtomicU64::new(0),
            events,
            wake: Notify::new(),
            shutdown,
        });

        let weak = Arc::downgrade(&inner);
        inner.queue.on_available_task(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.wake.notify_one();
            }
        }));

        let poller = tokio::spawn(poll_loop(inner.clone()));
        Self {
            inner,
            poller: Mutex::new(Some(poller)),
        }
    }

    /// Manager spawning the configured worker program
    pub fn from_config(
        config: &ForemanConfig,
        queue: Arc<dyn TaskQueue>,
        storage: Option<Arc<dyn TaskStorage>>,
    ) -> ExecutionResult<Self> {
        let launcher = CommandLauncher::from_config(&config.process)?;
        let processes = ProcessCollection::single(Arc::new(launcher), config.pool.spawn_attempts);
        let pool = WorkerPool::new(&config.pool, processes);
        Ok(Self::new(queue, pool, storage, &config.manager))
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    /// Enqueue a task and get a handle resolving with its final reporter
    pub async fn submit_task(&self, task: TaskDescriptor) -> ExecutionResult<SubmittedTask> {
        let task_id = task.id.clone();
        let waiter = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner
            .waiters()
            .entry(task_id.clone())
            .or_default()
            .push((waiter, tx));

        if let Err(e) = self.inner.queue.enqueue(task).await {
            let mut waiters = self.inner.waiters();
            if let Some(list) = waiters.get_mut(&task_id) {
                list.retain(|(id, _)| *id != waiter);
                if list.is_empty() {
                    waiters.remove(&task_id);
                }
            }
            return Err(e.into());
        }

        Ok(SubmittedTask {
            task_id,
            waiter,
            receiver: rx,
            manager: Arc::downgrade(&self.inner),
        })
    }

    /// Receive progress, completion and failure events of every task
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// Stop polling, close the queue and terminate the pool
    ///
    /// Workers are stopped after the pool's `terminate_timeout`.
    pub async fn terminate(&self) {
        self.terminate_with_timeout(self.inner.pool.config().terminate_timeout)
            .await;
    }

    /// Terminate with a custom grace period before workers are stopped
    pub async fn terminate_with_timeout(&self, timeout: Duration) {
        self.inner.shutdown.send_replace(true);
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(poller) = poller {
            let _ = poller.await;
        }

        if let Err(e) = self.inner.queue.close().await {
            warn!("Failed to close task queue: {}", e);
        }
        self.inner.pool.terminate(timeout).await;

        // Tasks still queued will never run here
        self.inner.waiters().clear();
        info!("Task manager terminated");
    }

    pub async fn stats(&self) -> ExecutionResult<ManagerStats> {
        Ok(ManagerStats {
            pool: self.inner.pool.info(),
            queue: self.inner.queue.info().await?,
        })
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        if let Some(poller) = self
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            poller.abort();
        }
    }
}
