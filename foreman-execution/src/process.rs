//! Worker process launching
//!
//! A [`ProcessLauncher`] produces a [`SpawnedProcess`]: the RPC connection to a
//! ready worker plus a control handle for signals and exit notification.
//! [`ProcessCollection`] round-robins launch attempts over several launchers.

use async_trait::async_trait;
use foreman_config::ProcessConfig;
use foreman_ipc::{memory_pair, methods, ChildProcessTransport, IpcError, Messenger, DEFAULT_RPC_TIMEOUT};
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::env::CHILD_ENV_VAR;
use crate::error::ExecutionError;
use crate::task::TaskRegistry;
use crate::worker::WorkerRuntime;

/// Signal used to stop a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

impl ProcessSignal {
    pub fn number(&self) -> i32 {
        match self {
            ProcessSignal::Terminate => 15,
            ProcessSignal::Kill => 9,
        }
    }
}

/// Control handle of a launched worker process
pub trait ProcessControl: Send + Sync {
    /// OS process id, if the worker runs in its own process
    fn pid(&self) -> Option<u32>;

    fn signal(&self, signal: ProcessSignal) -> Result<(), ExecutionError>;

    /// Watch flipped to `true` once the process has exited
    fn exit_watch(&self) -> watch::Receiver<bool>;

    fn has_exited(&self) -> bool {
        *self.exit_watch().borrow()
    }
}

/// Wait until a process has exited
pub async fn wait_exit(process: &dyn ProcessControl) {
    let mut rx = process.exit_watch();
    let _ = rx.wait_for(|exited| *exited).await;
}

/// A ready worker: its RPC connection and process handle
pub struct SpawnedProcess {
    pub messenger: Messenger,
    pub process: Arc<dyn ProcessControl>,
}

/// Starts worker processes
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self) -> Result<SpawnedProcess, ExecutionError>;
}

/// Round-robin over launchers, retrying failed launches
pub struct ProcessCollection {
    launchers: Vec<Arc<dyn ProcessLauncher>>,
    cursor: AtomicUsize,
    attempts: usize,
}

impl ProcessCollection {
    pub fn new(launchers: Vec<Arc<dyn ProcessLauncher>>, attempts: usize) -> Self {
        Self {
            launchers,
            cursor: AtomicUsize::new(0),
            attempts: attempts.max(1),
        }
    }

    pub fn single(launcher: Arc<dyn ProcessLauncher>, attempts: usize) -> Self {
        Self::new(vec![launcher], attempts)
    }

    /// Current launcher; the cursor then moves on, wrapping to the start
    fn next_launcher(&self) -> Option<Arc<dyn ProcessLauncher>> {
        if self.launchers.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.launchers.len();
        Some(self.launchers[index].clone())
    }

    /// Launch a worker, moving to the next launcher after each failure
    pub async fn spawn(&self) -> Result<SpawnedProcess, ExecutionError> {
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            let Some(launcher) = self.next_launcher() else {
                return Err(ExecutionError::Spawn("no process launchers configured".to_string()));
            };

            match launcher.launch().await {
                Ok(spawned) => return Ok(spawned),
                Err(e) => {
                    warn!("Worker launch attempt {}/{} failed: {}", attempt, self.attempts, e);
                    last_error = Some(e);
                }
            }
        }

        Err(ExecutionError::Spawn(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no launch attempted".to_string()),
        ))
    }
}

/// Process handle fed by a task that owns the actual worker
struct SupervisedProcess {
    pid: Option<u32>,
    signals: mpsc::UnboundedSender<ProcessSignal>,
    exited: watch::Receiver<bool>,
}

impl ProcessControl for SupervisedProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn signal(&self, signal: ProcessSignal) -> Result<(), ExecutionError> {
        if *self.exited.borrow() {
            return Ok(());
        }
        self.signals
            .send(signal)
            .map_err(|_| ExecutionError::InvalidState("process supervisor is gone".to_string()))
    }

    fn exit_watch(&self) -> watch::Receiver<bool> {
        self.exited.clone()
    }
}

/// Launches the worker executable as a child process speaking JSON lines on stdio
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    ready_timeout: Duration,
    rpc_timeout: Duration,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
            ready_timeout: Duration::from_secs(10),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Launcher for the configured worker program, defaulting to this executable
    pub fn from_config(config: &ProcessConfig) -> Result<Self, ExecutionError> {
        let program = match &config.worker_program {
            Some(program) => program.clone(),
            None => std::env::current_exe()
                .map_err(|e| ExecutionError::Spawn(format!("cannot locate current executable: {}", e)))?,
        };
        Ok(Self::new(program, config.worker_args.clone())
            .with_ready_timeout(config.ready_timeout)
            .with_rpc_timeout(config.rpc_timeout))
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn with_ready_timeout(mut self, ready_timeout: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self
    }

    /// Deadline for every call after the ready ping
    pub fn with_rpc_timeout(mut self, rpc_timeout: Duration) -> Self {
        self.rpc_timeout = rpc_timeout;
        self
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self) -> Result<SpawnedProcess, ExecutionError> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(CHILD_ENV_VAR, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            ExecutionError::Spawn(format!("{}: {}", self.program.display(), e))
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecutionError::Spawn("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::Spawn("worker stdout not captured".to_string()))?;
        let messenger = Messenger::spawn_with_timeout(ChildProcessTransport::connect(stdin, stdout), self.rpc_timeout);

        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(false);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    status = child.wait() => {
                        match status {
                            Ok(status) => debug!(?pid, %status, "Worker process exited"),
                            Err(e) => warn!(?pid, "Failed waiting for worker process: {}", e),
                        }
                        break;
                    }
                    Some(signal) = signal_rx.recv() => send_signal(&mut child, pid, signal),
                }
            }
            exit_tx.send_replace(true);
        });

        let process: Arc<dyn ProcessControl> = Arc::new(SupervisedProcess {
            pid,
            signals: signal_tx,
            exited: exit_rx,
        });

        match messenger
            .rpc_with_timeout(methods::PING, JsonValue::Null, self.ready_timeout)
            .await
        {
            Ok(_) => {
                info!(?pid, "Worker process ready");
                Ok(SpawnedProcess { messenger, process })
            }
            Err(IpcError::Timeout { timeout, .. }) => {
                let _ = process.signal(ProcessSignal::Kill);
                Err(ExecutionError::Spawn(format!("worker not ready within {:?}", timeout)))
            }
            Err(e) => {
                let _ = process.signal(ProcessSignal::Kill);
                Err(ExecutionError::Spawn(format!("worker did not answer ping: {}", e)))
            }
        }
    }
}

#[cfg(unix)]
fn send_signal(_child: &mut tokio::process::Child, pid: Option<u32>, signal: ProcessSignal) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return;
    };
    let sig = match signal {
        ProcessSignal::Terminate => Signal::SIGTERM,
        ProcessSignal::Kill => Signal::SIGKILL,
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), sig) {
        warn!(pid, "Failed to send {:?} to worker: {}", sig, e);
    }
}

#[cfg(not(unix))]
fn send_signal(child: &mut tokio::process::Child, pid: Option<u32>, _signal: ProcessSignal) {
    if let Err(e) = child.start_kill() {
        warn!(?pid, "Failed to kill worker: {}", e);
    }
}

/// Runs workers on the current runtime over an in-memory transport
///
/// Both signals stop the hosted worker immediately, like a process that does
/// not handle SIGTERM, unless [`LocalLauncher::trapping_terminate`] is set.
pub struct LocalLauncher {
    registry: Arc<TaskRegistry>,
    trap_terminate: bool,
    rpc_timeout: Duration,
}

impl LocalLauncher {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self {
            registry,
            trap_terminate: false,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    pub fn with_rpc_timeout(mut self, rpc_timeout: Duration) -> Self {
        self.rpc_timeout = rpc_timeout;
        self
    }

    /// Hosted workers ignore [`ProcessSignal::Terminate`] and only stop on kill
    pub fn trapping_terminate(mut self) -> Self {
        self.trap_terminate = true;
        self
    }
}

#[async_trait]
impl ProcessLauncher for LocalLauncher {
    async fn launch(&self) -> Result<SpawnedProcess, ExecutionError> {
        let (parent_side, child_side) = memory_pair();
        let messenger = Messenger::spawn_with_timeout(parent_side, self.rpc_timeout);
        let child_messenger = Messenger::spawn(child_side);

        let runtime = WorkerRuntime::new(self.registry.clone(), child_messenger.clone());
        let mut worker = tokio::spawn(runtime.run());

        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(false);

        let trap_terminate = self.trap_terminate;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = &mut worker => {
                        if let Ok(Err(e)) = result {
                            warn!("Local worker stopped with error: {}", e);
                        }
                        break;
                    }
                    Some(signal) = signal_rx.recv() => {
                        if trap_terminate && signal == ProcessSignal::Terminate {
                            debug!("Local worker ignored {:?}", signal);
                            continue;
                        }
                        debug!("Local worker received {:?}", signal);
                        worker.abort();
                        let _ = worker.await;
                        break;
                    }
                }
            }
            child_messenger.shutdown().await;
            exit_tx.send_replace(true);
        });

        Ok(SpawnedProcess {
            messenger,
            process: Arc::new(SupervisedProcess {
                pid: None,
                signals: signal_tx,
                exited: exit_rx,
            }),
        })
    }
}
