use crate::core::task::TaskId;
use crate::exec::breaker::BreakerSnapshot;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {task_id} timed out after {timeout:?}")]
    Timeout {
        task_id: TaskId,
        timeout: std::time::Duration,
    },

    #[error("Circuit breaker '{breaker}' is open")]
    CircuitOpen {
        breaker: String,
        snapshot: BreakerSnapshot,
    },

    #[error("Task {task_id} failed: {message}")]
    Execution { task_id: TaskId, message: String },

    #[error("Task {task_id} was cancelled: {reason}")]
    Cancelled { task_id: TaskId, reason: String },

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Queue is shut down")]
    QueueShutdown,
}

/// Coarse error category, used by the circuit breaker's exclusion set.
///
/// Breakers count failures by kind so that, e.g., pure client-side
/// validation errors can be excluded from the failure rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Io,
    Json,
    Toml,
    Validation,
    TaskNotFound,
    Timeout,
    CircuitOpen,
    Execution,
    Cancelled,
    TaskJoin,
    QueueShutdown,
}

impl Error {
    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::Json(_) => ErrorKind::Json,
            Error::TomlParse(_) | Error::TomlSerialize(_) => ErrorKind::Toml,
            Error::Validation(_) => ErrorKind::Validation,
            Error::TaskNotFound(_) => ErrorKind::TaskNotFound,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Error::Execution { .. } => ErrorKind::Execution,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::TaskJoin(_) => ErrorKind::TaskJoin,
            Error::QueueShutdown => ErrorKind::QueueShutdown,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
