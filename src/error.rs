//! Error types for iprocess.

use crate::worker::protocol::{ResponseEnvelope, Status};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Main error type for iprocess.
#[derive(Error, Debug)]
pub enum IprocError {
    /// The worker answered with a non-200 envelope, or could not be reached.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("The worker process has not been started")]
    NotStarted,

    #[error("The worker process was already started")]
    AlreadyStarted,

    #[error("Invalid operation registration: {0}")]
    Registration(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("System error: {0}")]
    Sys(#[from] nix::errno::Errno),
}

impl IprocError {
    /// Status code of a remote failure, if this is one.
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::Remote(e) => Some(e.status),
            _ => None,
        }
    }

    /// Check whether the worker could not be reached (status 502).
    pub fn is_unreachable(&self) -> bool {
        self.status() == Some(Status::Unreachable)
    }
}

/// Result type alias for iprocess operations.
pub type Result<T> = std::result::Result<T, IprocError>;

/// A failed remote call: the status, the error description and, when the
/// worker produced one, the traceback.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub status: Status,
    pub data: Value,
    pub traceback: Option<String>,
}

impl RemoteError {
    /// Build the error raised when the worker has exited or cannot be reached.
    pub fn unreachable(exit_code: Option<i32>) -> Self {
        let code = exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
        Self {
            status: Status::Unreachable,
            data: Value::String(format!("worker is not running (exit code: {code})")),
            traceback: None,
        }
    }

    /// Build a `BadArguments` error raised on the caller side.
    pub fn bad_arguments(message: impl Into<String>) -> Self {
        Self {
            status: Status::BadArguments,
            data: Value::String(message.into()),
            traceback: None,
        }
    }

    /// Human-readable description carried in `data`.
    pub fn message(&self) -> String {
        match &self.data {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl From<ResponseEnvelope> for RemoteError {
    fn from(response: ResponseEnvelope) -> Self {
        Self {
            status: response.status,
            data: response.data,
            traceback: response.traceback,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status: {}\ndata: {}", self.status.code(), self.message())?;
        if let Some(tb) = &self.traceback {
            write!(f, "\ntraceback: {tb}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}
