//! Envelopes exchanged between the parent and the worker.
//!
//! Messages are JSON-serialized and newline-delimited.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Outcome of a remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum Status {
    /// 200: the operation returned normally.
    Ok,
    /// 400: unknown operation, wrong arity or wrong argument types.
    BadArguments,
    /// 500: the operation failed while executing.
    InternalFailure,
    /// 502: the worker has exited or cannot be reached.
    Unreachable,
}

impl Status {
    /// Numeric status code.
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadArguments => 400,
            Self::InternalFailure => 500,
            Self::Unreachable => 502,
        }
    }
}

impl From<Status> for u16 {
    fn from(status: Status) -> Self {
        status.code()
    }
}

impl TryFrom<u16> for Status {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            200 => Ok(Self::Ok),
            400 => Ok(Self::BadArguments),
            500 => Ok(Self::InternalFailure),
            502 => Ok(Self::Unreachable),
            other => Err(format!("unknown status code {other}")),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Request from parent to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Name of the registered operation.
    pub operation: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

/// Response from worker to parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: Status,
    /// Return value on success, error description otherwise.
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl RequestEnvelope {
    /// Create a request with positional and keyword arguments.
    pub fn new(operation: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            operation: operation.into(),
            args,
            kwargs,
        }
    }

    /// Create a request without arguments (property reads, introspection).
    pub fn bare(operation: impl Into<String>) -> Self {
        Self::new(operation, Vec::new(), Map::new())
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl ResponseEnvelope {
    /// Create a successful response.
    pub fn ok(data: Value) -> Self {
        Self {
            status: Status::Ok,
            data,
            traceback: None,
        }
    }

    /// Create a 400 response.
    pub fn bad_arguments(message: impl Into<String>, traceback: impl Into<String>) -> Self {
        Self {
            status: Status::BadArguments,
            data: Value::String(message.into()),
            traceback: Some(traceback.into()),
        }
    }

    /// Create a 500 response.
    pub fn internal(message: impl Into<String>, traceback: impl Into<String>) -> Self {
        Self {
            status: Status::InternalFailure,
            data: Value::String(message.into()),
            traceback: Some(traceback.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
