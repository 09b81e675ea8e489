//! IPC transport implementations
//!
//! Frames travel as newline-delimited JSON envelopes over process pipes, or
//! through an in-memory channel pair when the worker runs inside the parent.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, RpcFrame, IPC_PROTOCOL_VERSION};

/// Sending half of a frame transport
#[async_trait]
pub trait FrameSender: Send {
    /// Send a frame to the other end
    async fn send(&mut self, message: &MessageEnvelope<RpcFrame>) -> Result<(), IpcError>;

    /// Close the sending half
    async fn close(&mut self) -> Result<(), IpcError>;
}

/// Receiving half of a frame transport
#[async_trait]
pub trait FrameReceiver: Send {
    /// Receive the next frame; `ConnectionClosed` once the peer is gone
    async fn receive(&mut self) -> Result<MessageEnvelope<RpcFrame>, IpcError>;
}

/// A bidirectional channel to a peer process
pub struct Transport {
    pub sender: Box<dyn FrameSender>,
    pub receiver: Box<dyn FrameReceiver>,
}

impl Transport {
    pub fn new(sender: Box<dyn FrameSender>, receiver: Box<dyn FrameReceiver>) -> Self {
        Self { sender, receiver }
    }
}

/// Writes JSON-lines envelopes to any async writer
pub struct JsonLinesWriter<W> {
    writer: Option<W>,
}

impl<W> JsonLinesWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSender for JsonLinesWriter<W> {
    async fn send(&mut self, message: &MessageEnvelope<RpcFrame>) -> Result<(), IpcError> {
        let writer = self.writer.as_mut().ok_or(IpcError::ConnectionClosed)?;

        let json = serde_json::to_string(message).map_err(|e| IpcError::Encode(e.to_string()))?;

        // Send with newline delimiter
        let message_with_newline = format!("{}\n", json);
        writer.write_all(message_with_newline.as_bytes()).await?;
        writer.flush().await?;

        Ok(())
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }
}

/// Reads JSON-lines envelopes from any async reader
///
/// The buffered reader lives as long as the transport, so bytes read ahead of
/// a line boundary are never lost between calls.
pub struct JsonLinesReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> JsonLinesReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: String::new(),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameReceiver for JsonLinesReader<R> {
    async fn receive(&mut self) -> Result<MessageEnvelope<RpcFrame>, IpcError> {
        loop {
            self.line.clear();
            let read = self.reader.read_line(&mut self.line).await?;
            if read == 0 {
                return Err(IpcError::ConnectionClosed);
            }

            let line = self.line.trim_end();
            if line.is_empty() {
                continue;
            }

            let envelope: MessageEnvelope<RpcFrame> = serde_json::from_str(line)
                .map_err(|e| IpcError::InvalidMessage(e.to_string()))?;

            return check_version(envelope);
        }
    }
}

fn check_version(
    envelope: MessageEnvelope<RpcFrame>,
) -> Result<MessageEnvelope<RpcFrame>, IpcError> {
    if envelope.protocol_version != IPC_PROTOCOL_VERSION {
        return Err(IpcError::ProtocolVersionMismatch {
            expected: IPC_PROTOCOL_VERSION,
            actual: envelope.protocol_version,
        });
    }
    Ok(envelope)
}

/// Stdin/Stdout IPC transport used by a worker process to reach its parent
pub struct StdioTransport;

impl StdioTransport {
    pub fn connect() -> Transport {
        Transport::new(
            Box::new(JsonLinesWriter::new(tokio::io::stdout())),
            Box::new(JsonLinesReader::new(tokio::io::stdin())),
        )
    }
}

/// Child process transport for parent-child communication
pub struct ChildProcessTransport;

impl ChildProcessTransport {
    pub fn connect(
        stdin: tokio::process::ChildStdin,
        stdout: tokio::process::ChildStdout,
    ) -> Transport {
        Transport::new(
            Box::new(JsonLinesWriter::new(stdin)),
            Box::new(JsonLinesReader::new(stdout)),
        )
    }
}

struct MemorySender {
    tx: Option<mpsc::UnboundedSender<MessageEnvelope<RpcFrame>>>,
}

#[async_trait]
impl FrameSender for MemorySender {
    async fn send(&mut self, message: &MessageEnvelope<RpcFrame>) -> Result<(), IpcError> {
        let tx = self.tx.as_ref().ok_or(IpcError::ConnectionClosed)?;
        tx.send(message.clone())
            .map_err(|_| IpcError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        self.tx.take();
        Ok(())
    }
}

struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<MessageEnvelope<RpcFrame>>,
}

#[async_trait]
impl FrameReceiver for MemoryReceiver {
    async fn receive(&mut self) -> Result<MessageEnvelope<RpcFrame>, IpcError> {
        match self.rx.recv().await {
            Some(envelope) => check_version(envelope),
            None => Err(IpcError::ConnectionClosed),
        }
    }
}

/// Two connected in-memory transports, for workers hosted on the parent runtime
pub fn memory_pair() -> (Transport, Transport) {
    let (left_tx, left_rx) = mpsc::unbounded_channel();
    let (right_tx, right_rx) = mpsc::unbounded_channel();

    let left = Transport::new(
        Box::new(MemorySender { tx: Some(left_tx) }),
        Box::new(MemoryReceiver { rx: right_rx }),
    );
    let right = Transport::new(
        Box::new(MemorySender { tx: Some(right_tx) }),
        Box::new(MemoryReceiver { rx: left_rx }),
    );
    (left, right)
}
