//! Message shapes for the line-delimited JSON channels spoken by both the
//! QEMU monitor and the guest agent.
//!
//! Both channels frame every message as a single JSON object terminated by
//! `\n`. A request has the shape `{"execute": name, "arguments": {...}}`; a
//! reply is either `{"return": ...}` or `{"error": {"class", "desc"}}`; the
//! monitor additionally emits out-of-band `{"event": ..., "data": ...,
//! "timestamp": ...}` messages that are not replies to anything.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A command sent to the monitor or guest-agent socket.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    /// Command name, e.g. `"transaction"` or `"guest-fsfreeze-freeze"`.
    pub execute: String,
    /// Command arguments. Omitted from the wire form when empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl Request {
    /// Builds a request with no arguments.
    pub fn new(execute: impl Into<String>) -> Self {
        Self { execute: execute.into(), arguments: None }
    }

    /// Builds a request carrying the given arguments.
    pub fn with_arguments(execute: impl Into<String>, arguments: Value) -> Self {
        Self { execute: execute.into(), arguments: Some(arguments) }
    }
}

/// Error payload embedded in a failed reply.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorInfo {
    /// Machine-readable error class, e.g. `"GenericError"`.
    pub class: String,
    /// Human-readable description.
    pub desc: String,
}

/// One line received on a monitor or guest-agent socket: either a reply to
/// the most recently sent request, or an asynchronous event.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Incoming {
    /// Out-of-band notification, never a reply to a specific request.
    Event(Event),
    /// Reply to the previously sent request.
    Reply(Reply),
}

/// A monitor event line.
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    /// Event name, e.g. `"BLOCK_JOB_COMPLETED"`.
    pub event: String,
    /// Event payload, shape depends on `event`.
    #[serde(default)]
    pub data: Value,
    /// Monitor-supplied timestamp, `{"seconds", "microseconds"}`.
    #[serde(default)]
    pub timestamp: Value,
}

/// A reply to a request: success carries `return`, failure carries `error`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    /// Command succeeded.
    Return {
        /// Command-specific result payload.
        #[serde(rename = "return")]
        value: Value,
    },
    /// Command failed.
    Error {
        /// Error class and description.
        error: ErrorInfo,
    },
}

impl Reply {
    /// Turns a reply into a `Result`, surfacing `error` as `Err`.
    pub fn into_result(self) -> Result<Value, ErrorInfo> {
        match self {
            Self::Return { value } => Ok(value),
            Self::Error { error } => Err(error),
        }
    }
}
