use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Workflow construction errors. Raised before any state is written.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("duplicate task name '{0}'")]
    DuplicateTask(String),

    #[error("task '{task}' depends on unknown task '{dep}'")]
    UnknownDependency { task: String, dep: String },

    #[error("cycle detected in workflow DAG, tasks involved: {involved:?}")]
    Cycle { involved: Vec<String> },

    #[error("task '{task}': {message}")]
    InvalidOption { task: String, message: String },
}

/// State persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("store unavailable after {attempts} write attempts: {message}")]
    Unavailable { attempts: u32, message: String },
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown queue provider '{0}'")]
    UnknownProvider(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

/// Classification of a task attempt failure, persisted on the task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskErrorKind {
    /// The task function returned an error.
    User,
    /// The per-attempt deadline was exceeded.
    Timeout,
    /// Cooperative cancellation was observed.
    Cancelled,
    /// The task output could not be serialized.
    Serialization,
}

impl TaskErrorKind {
    /// Whether a failure of this kind is subject to retry policy.
    pub fn is_retriable(&self) -> bool {
        matches!(self, TaskErrorKind::User | TaskErrorKind::Timeout)
    }
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskErrorKind::User => write!(f, "user"),
            TaskErrorKind::Timeout => write!(f, "timeout"),
            TaskErrorKind::Cancelled => write!(f, "cancelled"),
            TaskErrorKind::Serialization => write!(f, "serialization"),
        }
    }
}

/// Error details persisted on a task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskErrorInfo {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskErrorInfo {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Errors a scheduler run can surface to the caller.
///
/// Task-level failures never appear here: they land on the task records and
/// in the run status. Only an invalid workflow or an unrecoverable store
/// failure aborts a run.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
