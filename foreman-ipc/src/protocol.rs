//! IPC protocol definitions and message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Names of the RPC methods every worker process understands.
pub mod methods {
    /// Parent to child: hands over a serialized task descriptor.
    pub const SUBMIT_TASK: &str = "submit-task";
    /// Child to parent: hands back a reporter snapshot.
    pub const TASK_REPORT: &str = "task-report";
    /// Liveness check, answered as soon as the child runtime is wired.
    pub const PING: &str = "ping";
}

/// Error returned by the remote side of an RPC call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }
}

/// Result carried by a response frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RpcOutcome {
    Ok { payload: JsonValue },
    Err { error: RemoteError },
}

impl RpcOutcome {
    pub fn into_result(self) -> Result<JsonValue, RemoteError> {
        match self {
            RpcOutcome::Ok { payload } => Ok(payload),
            RpcOutcome::Err { error } => Err(error),
        }
    }
}

impl From<Result<JsonValue, RemoteError>> for RpcOutcome {
    fn from(result: Result<JsonValue, RemoteError>) -> Self {
        match result {
            Ok(payload) => RpcOutcome::Ok { payload },
            Err(error) => RpcOutcome::Err { error },
        }
    }
}

/// Frames exchanged in both directions between a parent and a worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcFrame {
    /// Named remote procedure call
    Request {
        correlation_id: Uuid,
        method: String,
        payload: JsonValue,
    },

    /// Answer to a request with the same correlation id
    Response {
        correlation_id: Uuid,
        outcome: RpcOutcome,
    },

    /// Graceful termination request sent by the parent
    Terminate,
}

/// Message envelope for all IPC communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_frame_wire_format() {
        let correlation_id = Uuid::new_v4();
        let frame = RpcFrame::Request {
            correlation_id,
            method: methods::SUBMIT_TASK.to_string(),
            payload: json!({"id": "task-1"}),
        };

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "request");
        assert_eq!(value["method"], "submit-task");
        assert_eq!(value["correlation_id"], correlation_id.to_string());
    }

    #[test]
    fn test_error_outcome_wire_format() {
        let frame = RpcFrame::Response {
            correlation_id: Uuid::new_v4(),
            outcome: RpcOutcome::Err {
                error: RemoteError::new("boom"),
            },
        };

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["outcome"]["status"], "err");
        assert_eq!(value["outcome"]["error"]["message"], "boom");
        assert!(value["outcome"]["error"].get("details").is_none());
    }

    #[test]
    fn test_outcome_conversion() {
        let ok: RpcOutcome = Ok(json!(3)).into();
        assert_eq!(ok.into_result(), Ok(json!(3)));

        let err: RpcOutcome = Err(RemoteError::new("nope").with_details(json!({"code": 7}))).into();
        let error = err.into_result().unwrap_err();
        assert_eq!(error.to_string(), "nope");
        assert_eq!(error.details, Some(json!({"code": 7})));
    }

    #[test]
    fn test_message_envelope() {
        let envelope = MessageEnvelope::new(RpcFrame::Terminate);
        assert_eq!(envelope.protocol_version, IPC_PROTOCOL_VERSION);
        assert!(envelope.is_compatible());

        let json = serde_json::to_string(&envelope).unwrap();
        let deserialized: MessageEnvelope<RpcFrame> = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.message, RpcFrame::Terminate);
    }
}
