//! Errors raised by the RPC layer

use std::time::Duration;
use thiserror::Error;

use crate::protocol::RemoteError;

#[derive(Debug, Error)]
pub enum IpcError {
    /// A frame could not be encoded for the wire
    #[error("Cannot encode frame: {0}")]
    Encode(String),

    /// A line arrived that is not a frame envelope
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport I/O failed: {0}")]
    Io(String),

    /// The peer went away, or this side shut the connection down
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unsupported protocol version {actual} (expected {expected})")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },

    /// The peer accepted the call but did not answer in time
    #[error("No response to '{method}' within {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// The remote handler answered with an error
    #[error("{0}")]
    Remote(RemoteError),
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            IpcError::Io(err.to_string())
        } else {
            IpcError::Encode(err.to_string())
        }
    }
}
