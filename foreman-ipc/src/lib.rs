//! Inter-process communication for Foreman
//!
//! This crate provides the RPC protocol, the frame transports and the
//! [`Messenger`] used between the main process and its worker processes.

pub mod error;
pub mod messenger;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use error::IpcError;
pub use messenger::{handler, Messenger, RpcHandler, RpcResult, DEFAULT_RPC_TIMEOUT};
pub use protocol::{
    methods, MessageEnvelope, RemoteError, RpcFrame, RpcOutcome, IPC_PROTOCOL_VERSION,
};
pub use transport::{
    memory_pair, ChildProcessTransport, FrameReceiver, FrameSender, JsonLinesReader,
    JsonLinesWriter, StdioTransport, Transport,
};
