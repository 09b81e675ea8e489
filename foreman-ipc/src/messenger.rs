//! Named RPC calls multiplexed over a frame transport
//!
//! A [`Messenger`] owns one reader task and one writer task per connection.
//! Outgoing frames are queued on an unbounded channel, so they leave in the
//! order they were issued. Incoming requests are dispatched to registered
//! handlers; a handler that completes without suspending answers before the
//! next frame is read. Calls fail with [`IpcError::Timeout`] when the peer does
//! not answer within the connection's RPC timeout.

use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::task::Poll;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, RemoteError, RpcFrame, RpcOutcome};
use crate::transport::{FrameReceiver, FrameSender, Transport};

/// RPC timeout of connections created with [`Messenger::spawn`]
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Result produced by an RPC handler
pub type RpcResult = Result<JsonValue, RemoteError>;

/// Handler for one named RPC method
pub type RpcHandler = Arc<dyn Fn(JsonValue) -> BoxFuture<'static, RpcResult> + Send + Sync>;

/// Wrap an async closure as an [`RpcHandler`]
pub fn handler<F, Fut>(f: F) -> RpcHandler
where
    F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

enum Outbound {
    Frame(RpcFrame),
    Close,
}

type PendingMap = HashMap<Uuid, oneshot::Sender<Result<JsonValue, IpcError>>>;

struct Inner {
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: Mutex<PendingMap>,
    handlers: Mutex<HashMap<String, RpcHandler>>,
    terminate: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    writer: Mutex<Option<JoinHandle<()>>>,
    rpc_timeout: Duration,
}

impl Inner {
    fn push(&self, frame: RpcFrame) -> Result<(), IpcError> {
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| IpcError::ConnectionClosed)
    }

    fn respond(&self, correlation_id: Uuid, result: RpcResult) {
        let frame = RpcFrame::Response {
            correlation_id,
            outcome: RpcOutcome::from(result),
        };
        if self.push(frame).is_err() {
            debug!("Dropping response {}: connection closed", correlation_id);
        }
    }

    fn complete(&self, correlation_id: Uuid, outcome: RpcOutcome) {
        let sender = lock(&self.pending).remove(&correlation_id);
        match sender {
            Some(tx) => {
                let _ = tx.send(outcome.into_result().map_err(IpcError::Remote));
            }
            None => trace!("Ignoring response {} with no waiter", correlation_id),
        }
    }

    fn mark_closed(&self) {
        self.closed.send_replace(true);
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(IpcError::ConnectionClosed));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cloneable handle to one RPC connection
#[derive(Clone)]
pub struct Messenger {
    inner: Arc<Inner>,
}

impl Messenger {
    /// Start the reader and writer tasks for a transport
    pub fn spawn(transport: Transport) -> Self {
        Self::spawn_with_timeout(transport, DEFAULT_RPC_TIMEOUT)
    }

    /// [`Messenger::spawn`] with a custom timeout for [`Messenger::rpc`]
    pub fn spawn_with_timeout(transport: Transport, rpc_timeout: Duration) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (terminate, _) = watch::channel(false);
        let (closed, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            outbound: outbound_tx,
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            terminate,
            closed,
            writer: Mutex::new(None),
            rpc_timeout,
        });

        let Transport { sender, receiver } = transport;
        let writer = tokio::spawn(write_loop(sender, outbound_rx, Arc::downgrade(&inner)));
        *lock(&inner.writer) = Some(writer);
        tokio::spawn(read_loop(receiver, Arc::downgrade(&inner)));

        Self { inner }
    }

    /// Register (or replace) the handler for a method name
    pub fn register_rpc(&self, method: impl Into<String>, handler: RpcHandler) {
        lock(&self.inner.handlers).insert(method.into(), handler);
    }

    pub fn unregister_rpc(&self, method: &str) {
        lock(&self.inner.handlers).remove(method);
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.inner.rpc_timeout
    }

    /// Call a remote method and wait for its response
    pub async fn rpc(&self, method: &str, payload: JsonValue) -> Result<JsonValue, IpcError> {
        self.rpc_with_timeout(method, payload, self.inner.rpc_timeout).await
    }

    /// [`Messenger::rpc`] with a deadline for this call only
    pub async fn rpc_with_timeout(
        &self,
        method: &str,
        payload: JsonValue,
        timeout: Duration,
    ) -> Result<JsonValue, IpcError> {
        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(correlation_id, tx);

        if self.is_closed() {
            lock(&self.inner.pending).remove(&correlation_id);
            return Err(IpcError::ConnectionClosed);
        }

        let frame = RpcFrame::Request {
            correlation_id,
            method: method.to_string(),
            payload,
        };
        if let Err(e) = self.inner.push(frame) {
            lock(&self.inner.pending).remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(response) => response.map_err(|_| IpcError::ConnectionClosed)?,
            Err(_) => {
                lock(&self.inner.pending).remove(&correlation_id);
                Err(IpcError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Queue a call whose response is not awaited
    ///
    /// The frame is enqueued before this returns, so detached calls keep the
    /// order in which they were issued.
    pub fn rpc_detached(&self, method: &str, payload: JsonValue) -> Result<(), IpcError> {
        self.inner.push(RpcFrame::Request {
            correlation_id: Uuid::new_v4(),
            method: method.to_string(),
            payload,
        })
    }

    /// Ask the peer to terminate gracefully
    pub fn terminate(&self) -> Result<(), IpcError> {
        self.inner.push(RpcFrame::Terminate)
    }

    /// Watch flipped to `true` when the peer asked us to terminate
    pub fn terminate_requested(&self) -> watch::Receiver<bool> {
        self.inner.terminate.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolve once the peer has gone away
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Flush queued frames, close the sending half and wait for the writer
    pub async fn shutdown(&self) {
        let _ = self.inner.outbound.send(Outbound::Close);
        let writer = lock(&self.inner.writer).take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }
}

async fn write_loop(
    mut sender: Box<dyn FrameSender>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inner: Weak<Inner>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(frame) => {
                if let Err(e) = sender.send(&MessageEnvelope::new(frame)).await {
                    warn!("Failed to write IPC frame: {}", e);
                    break;
                }
            }
            Outbound::Close => break,
        }
    }

    if let Err(e) = sender.close().await {
        debug!("Error closing IPC sender: {}", e);
    }
    if let Some(inner) = inner.upgrade() {
        inner.mark_closed();
    }
}

async fn read_loop(mut receiver: Box<dyn FrameReceiver>, inner: Weak<Inner>) {
    loop {
        let frame = match receiver.receive().await {
            Ok(envelope) => envelope.message,
            Err(IpcError::ConnectionClosed) => break,
            Err(IpcError::InvalidMessage(e)) => {
                warn!("Skipping malformed IPC frame: {}", e);
                continue;
            }
            Err(e) => {
                warn!("IPC receive failed: {}", e);
                break;
            }
        };

        let Some(inner_ref) = inner.upgrade() else {
            break;
        };

        match frame {
            RpcFrame::Request {
                correlation_id,
                method,
                payload,
            } => {
                let handler = lock(&inner_ref.handlers).get(&method).cloned();
                let Some(handler) = handler else {
                    debug!("No handler registered for rpc method '{}'", method);
                    inner_ref.respond(
                        correlation_id,
                        Err(RemoteError::new(format!("unknown rpc method '{}'", method))),
                    );
                    continue;
                };

                let mut fut = handler(payload);
                match futures::poll!(&mut fut) {
                    Poll::Ready(result) => inner_ref.respond(correlation_id, result),
                    Poll::Pending => {
                        let weak = inner.clone();
                        tokio::spawn(async move {
                            let result = fut.await;
                            if let Some(inner) = weak.upgrade() {
                                inner.respond(correlation_id, result);
                            }
                        });
                    }
                }
            }
            RpcFrame::Response {
                correlation_id,
                outcome,
            } => inner_ref.complete(correlation_id, outcome),
            RpcFrame::Terminate => {
                debug!("Peer requested termination");
                inner_ref.terminate.send_replace(true);
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.mark_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory_pair;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_rpc_round_trip() {
        let (left, right) = memory_pair();
        let parent = Messenger::spawn(left);
        let child = Messenger::spawn(right);

        child.register_rpc(
            "double",
            handler(|payload: JsonValue| async move {
                let n = payload.as_i64().ok_or_else(|| RemoteError::new("not a number"))?;
                Ok(json!(n * 2))
            }),
        );

        assert_eq!(parent.rpc("double", json!(21)).await.unwrap(), json!(42));

        let err = parent.rpc("double", json!("x")).await.unwrap_err();
        assert!(matches!(err, IpcError::Remote(ref e) if e.message == "not a number"));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (left, right) = memory_pair();
        let parent = Messenger::spawn(left);
        let _child = Messenger::spawn(right);

        let err = parent.rpc("missing", json!(null)).await.unwrap_err();
        assert!(err.to_string().contains("unknown rpc method 'missing'"));
    }

    #[tokio::test]
    async fn test_detached_calls_keep_order() {
        let (left, right) = memory_pair();
        let parent = Messenger::spawn(left);
        let child = Messenger::spawn(right);

        let (tx, mut rx) = mpsc::unbounded_channel();
        parent.register_rpc(
            "report",
            handler(move |payload| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(payload);
                    Ok(JsonValue::Null)
                }
            }),
        );

        for i in 0..20 {
            child.rpc_detached("report", json!(i)).unwrap();
        }
        for i in 0..20 {
            assert_eq!(rx.recv().await.unwrap(), json!(i));
        }
    }

    #[tokio::test]
    async fn test_terminate_and_close() {
        let (left, right) = memory_pair();
        let parent = Messenger::spawn(left);
        let child = Messenger::spawn(right);

        let mut terminate = child.terminate_requested();
        parent.terminate().unwrap();
        tokio::time::timeout(Duration::from_secs(1), terminate.wait_for(|t| *t))
            .await
            .unwrap()
            .unwrap();

        child.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), parent.closed())
            .await
            .unwrap();
        assert!(parent.is_closed());
        assert!(matches!(
            parent.rpc("ping", json!(null)).await,
            Err(IpcError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_unanswered_call_times_out() {
        let (left, right) = memory_pair();
        let parent = Messenger::spawn_with_timeout(left, Duration::from_millis(100));
        let child = Messenger::spawn(right);

        child.register_rpc(
            "stuck",
            handler(|_| async {
                futures::future::pending::<()>().await;
                Ok(JsonValue::Null)
            }),
        );

        let err = tokio::time::timeout(Duration::from_secs(2), parent.rpc("stuck", json!(null)))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err,
            IpcError::Timeout { ref method, timeout } if method == "stuck" && timeout == Duration::from_millis(100)
        ));
        assert!(lock(&parent.inner.pending).is_empty());

        // The connection stays usable, and a per-call deadline overrides the default
        child.register_rpc("echo", handler(|payload| async move { Ok(payload) }));
        assert_eq!(parent.rpc("echo", json!(3)).await.unwrap(), json!(3));
        let err = parent
            .rpc_with_timeout("stuck", json!(null), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Timeout { timeout, .. } if timeout == Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_pending_calls_fail_when_peer_goes_away() {
        let (left, right) = memory_pair();
        let parent = Messenger::spawn(left);
        let child = Messenger::spawn(right);

        child.register_rpc(
            "slow",
            handler(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(JsonValue::Null)
            }),
        );

        let call = tokio::spawn({
            let parent = parent.clone();
            async move { parent.rpc("slow", JsonValue::Null).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        child.shutdown().await;

        let result = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(IpcError::ConnectionClosed)));
    }
}
