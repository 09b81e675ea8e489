//! Worker pool: spawns processes on demand and routes tasks to them

use foreman_config::PoolConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ExecutionError, ExecutionResult};
use crate::pool_worker::{PoolWorker, WorkerEvent};
use crate::process::ProcessCollection;
use crate::reporter::{ListenerId, ProgressReporter, ReporterEvent};
use crate::task::TaskKind;

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub current_processes: usize,
    pub max_processes: usize,
    pub current_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub total_tasks: u64,
}

#[derive(Default)]
struct PoolState {
    workers: Vec<Arc<PoolWorker>>,
    /// Workers taken out of rotation that have not exited yet
    retired: Vec<Arc<PoolWorker>>,
    spawning: usize,
    max_processes: usize,
    ttl_timers: HashMap<Uuid, JoinHandle<()>>,
    terminating: bool,
}

struct PoolInner {
    config: PoolConfig,
    processes: ProcessCollection,
    state: Mutex<PoolState>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Set of pool workers sized between `min_size` and `max_size`
///
/// Sync tasks take a worker with no tasks, async tasks share a worker up to
/// `max_jobs_per_process`. Idle workers are terminated after `ttl`.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(config: &PoolConfig, processes: ProcessCollection) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            config: config.normalized(),
            processes,
            state: Mutex::new(PoolState::default()),
            events,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        tokio::spawn(event_loop(Arc::downgrade(&inner), events_rx));
        Self { inner }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Count the reporter's outcome in [`PoolStats`]
    ///
    /// Listeners run in subscription order, so anything subscribed after this
    /// call observes the updated counters when the task settles.
    pub fn track(&self, reporter: &ProgressReporter) -> ListenerId {
        let inner = Arc::downgrade(&self.inner);
        reporter.subscribe(move |event, _| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            match event {
                ReporterEvent::Done => {
                    inner.completed.fetch_add(1, Ordering::SeqCst);
                }
                ReporterEvent::Failed => {
                    inner.failed.fetch_add(1, Ordering::SeqCst);
                }
                ReporterEvent::Change => {}
            }
        })
    }

    /// Bind the reporter's task to a worker and send it over
    ///
    /// Resolves once the child accepted the task, not when it finishes.
    /// Fails with [`ExecutionError::NoCapacity`] when no worker can take the
    /// task and the pool is at `max_size`.
    pub async fn submit_task(&self, reporter: &ProgressReporter) -> ExecutionResult<()> {
        let stats = self.track(reporter);
        let result = self.submit_tracked(reporter).await;
        if result.is_err() {
            reporter.unsubscribe(stats);
        }
        result
    }

    /// [`WorkerPool::submit_task`] for a reporter already passed to
    /// [`WorkerPool::track`]
    pub async fn submit_tracked(&self, reporter: &ProgressReporter) -> ExecutionResult<()> {
        let kind = reporter.task().kind;

        let worker = match self.try_bind(reporter, kind)? {
            Some(worker) => worker,
            None => {
                if !self.reserve_spawn() {
                    return Err(ExecutionError::NoCapacity);
                }
                self.spawn_reserved().await?;
                self.try_bind(reporter, kind)?
                    .ok_or(ExecutionError::NoCapacity)?
            }
        };

        worker.dispatch(reporter).await
    }

    /// Bind to the first worker that can take a task of this kind
    fn try_bind(&self, reporter: &ProgressReporter, kind: TaskKind) -> ExecutionResult<Option<Arc<PoolWorker>>> {
        let mut state = self.inner.state();
        if state.terminating {
            return Err(ExecutionError::InvalidState("pool is terminating".to_string()));
        }

        let Some(worker) = state
            .workers
            .iter()
            .find(|worker| worker.can_accept(kind))
            .cloned()
        else {
            return Ok(None);
        };

        worker.bind(reporter)?;
        if let Some(timer) = state.ttl_timers.remove(&worker.id()) {
            timer.abort();
        }
        Ok(Some(worker))
    }

    fn reserve_spawn(&self) -> bool {
        let mut state = self.inner.state();
        if state.terminating || state.workers.len() + state.spawning >= self.inner.config.max_size {
            return false;
        }
        state.spawning += 1;
        true
    }

    async fn spawn_reserved(&self) -> ExecutionResult<Arc<PoolWorker>> {
        let spawned = self.inner.processes.spawn().await;

        let mut state = self.inner.state();
        state.spawning -= 1;
        let spawned = spawned?;

        let worker = PoolWorker::start(
            spawned,
            self.inner.config.max_jobs_per_process,
            self.inner.events.clone(),
        );
        if state.terminating {
            drop(state);
            worker.request_terminate();
            return Err(ExecutionError::InvalidState("pool is terminating".to_string()));
        }

        state.workers.push(worker.clone());
        state.max_processes = state.max_processes.max(state.workers.len());
        let timer = arm_ttl(&self.inner, worker.id());
        state.ttl_timers.insert(worker.id(), timer);

        info!(worker_id = %worker.id(), workers = state.workers.len(), "Spawned pool worker");
        Ok(worker)
    }

    /// Capacity check
    ///
    /// Returns true when a worker without tasks exists. Otherwise starts a
    /// spawn in the background if the pool is below `max_size`.
    pub fn ping(&self) -> bool {
        if self.can_process_sync_task() {
            return true;
        }

        if self.reserve_spawn() {
            let pool = self.clone();
            tokio::spawn(async move {
                if let Err(e) = pool.spawn_reserved().await {
                    warn!("Background worker spawn failed: {}", e);
                }
            });
        }
        false
    }

    pub fn can_process_sync_task(&self) -> bool {
        self.inner
            .state()
            .workers
            .iter()
            .any(|worker| worker.can_accept(TaskKind::Sync))
    }

    pub fn can_process_async_task(&self) -> bool {
        self.inner
            .state()
            .workers
            .iter()
            .any(|worker| worker.can_accept(TaskKind::Async))
    }

    /// Wait `timeout`, then terminate every worker and resolve once all exited
    pub async fn terminate(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;

        let workers: Vec<Arc<PoolWorker>> = {
            let mut state = self.inner.state();
            state.terminating = true;
            for (_, timer) in state.ttl_timers.drain() {
                timer.abort();
            }
            let mut workers: Vec<_> = state.workers.drain(..).collect();
            workers.extend(state.retired.drain(..));
            workers
        };

        info!(workers = workers.len(), "Terminating worker pool");
        for worker in &workers {
            worker.request_terminate();
        }
        futures::future::join_all(workers.iter().map(|worker| worker.wait_exit())).await;
        debug!("All pool workers exited");
    }

    pub fn info(&self) -> PoolStats {
        let state = self.inner.state();
        let completed = self.inner.completed.load(Ordering::SeqCst);
        let failed = self.inner.failed.load(Ordering::SeqCst);

        PoolStats {
            current_processes: state.workers.len(),
            max_processes: state.max_processes,
            current_tasks: state.workers.iter().map(|worker| worker.task_count()).sum(),
            completed_tasks: completed,
            failed_tasks: failed,
            total_tasks: completed + failed,
        }
    }
}

/// Idle watchdog for one worker
fn arm_ttl(inner: &Arc<PoolInner>, worker_id: Uuid) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let ttl = inner.config.ttl;

    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };

        let expired = {
            let mut state = inner.state();
            state.ttl_timers.remove(&worker_id);
            let position = state
                .workers
                .iter()
                .position(|worker| worker.id() == worker_id && worker.task_count() == 0);
            position.map(|index| {
                let worker = state.workers.remove(index);
                state.retired.push(worker.clone());
                worker
            })
        };

        if let Some(worker) = expired {
            info!(worker_id = %worker_id, "Worker idle for {:?}, terminating", ttl);
            worker.request_terminate();
        }
    })
}

async fn event_loop(inner: Weak<PoolInner>, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match event {
            WorkerEvent::Idle(worker_id) => {
                let mut state = inner.state();
                let idle = state
                    .workers
                    .iter()
                    .any(|worker| worker.id() == worker_id && worker.task_count() == 0);
                if idle && !state.terminating {
                    let timer = arm_ttl(&inner, worker_id);
                    if let Some(previous) = state.ttl_timers.insert(worker_id, timer) {
                        previous.abort();
                    }
                }
            }
            WorkerEvent::Exited(worker_id) => {
                let mut state = inner.state();
                state.workers.retain(|worker| worker.id() != worker_id);
                state.retired.retain(|worker| worker.id() != worker_id);
                if let Some(timer) = state.ttl_timers.remove(&worker_id) {
                    timer.abort();
                }
                debug!(worker_id = %worker_id, workers = state.workers.len(), "Worker removed from pool");
            }
        }
    }
}
