//! Persistent, retryable background tasks
//!
//! Tasks are stored in the database and dispatched one at a time by the
//! [`TaskExecutor`]. Each [`TaskType`] has a [`TaskHandler`] that reports a
//! [`TaskOutcome`]; retryable failures are resubmitted until the
//! [`RetryPolicy`] is exhausted.

pub mod chunk;
pub mod executor;
pub mod pull;
pub mod retry;

use crate::storage::{Database, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

pub use chunk::{ChunkPlan, ChunkedPullCoordinator};
pub use executor::TaskExecutor;
pub use pull::{PeerLocator, PullFileHandler, PullIconHandler, ResourceLocks};
pub use retry::RetryPolicy;

/// Kind of work a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    PullFile,
    PullIcon,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::PullFile => "pull_file",
            TaskType::PullIcon => "pull_icon",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pull_file" => Ok(TaskType::PullFile),
            "pull_icon" => Ok(TaskType::PullIcon),
            other => Err(TaskError::UnknownType(other.to_string())),
        }
    }
}

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Preparing,
    Executing,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Preparing => "preparing",
            TaskStatus::Executing => "executing",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
        }
    }

    /// Terminal tasks are never dispatched again
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preparing" => Ok(TaskStatus::Preparing),
            "executing" => Ok(TaskStatus::Executing),
            "success" => Ok(TaskStatus::Success),
            "failure" => Ok(TaskStatus::Failure),
            other => Err(TaskError::UnknownStatus(other.to_string())),
        }
    }
}

/// One past run of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// None when the attempt succeeded
    pub error: Option<String>,
}

/// Stored task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub history: Vec<ExecutionAttempt>,
    /// Type-specific payload, including resumable progress
    pub extra: Value,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(task_type: TaskType, extra: Value) -> Self {
        let now = Utc::now();
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            task_type,
            status: TaskStatus::Preparing,
            history: Vec::new(),
            extra,
            created_at: now,
            modified_at: now,
        }
    }

    /// Error of the most recent attempt
    pub fn last_error(&self) -> Option<&str> {
        self.history.last().and_then(|a| a.error.as_deref())
    }
}

/// Result of one handler run
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success {
        extra: Option<Value>,
    },
    Failure {
        extra: Option<Value>,
        message: String,
        retryable: bool,
    },
}

impl TaskOutcome {
    pub fn success() -> Self {
        TaskOutcome::Success { extra: None }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        TaskOutcome::Failure {
            extra: None,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        TaskOutcome::Failure {
            extra: None,
            message: message.into(),
            retryable: false,
        }
    }

    /// Replace the stored payload when the outcome is recorded
    pub fn with_extra(self, value: Value) -> Self {
        match self {
            TaskOutcome::Success { .. } => TaskOutcome::Success { extra: Some(value) },
            TaskOutcome::Failure {
                message, retryable, ..
            } => TaskOutcome::Failure {
                extra: Some(value),
                message,
                retryable,
            },
        }
    }
}

/// Handle given to a running handler
#[derive(Clone)]
pub struct TaskContext {
    db: Arc<Database>,
    task_id: String,
}

impl TaskContext {
    pub fn new(db: Arc<Database>, task_id: impl Into<String>) -> Self {
        Self {
            db,
            task_id: task_id.into(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Persist intermediate progress so a retry can resume from it
    pub async fn save_extra(&self, extra: &Value) -> Result<(), StorageError> {
        self.db.save_task_extra(&self.task_id, extra).await
    }
}

/// Executes one task type
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, task: &TaskRecord, ctx: &TaskContext) -> TaskOutcome;
}

/// Published when a task reaches a terminal status
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Finished {
        task_id: String,
        task_type: TaskType,
        status: TaskStatus,
        error: Option<String>,
    },
}

/// Task layer errors
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("CM020: Unknown task '{0}'.")]
    UnknownTask(String),

    #[error("CM021: Unknown task type '{0}'.")]
    UnknownType(String),

    #[error("CM022: Unknown task status '{0}'.")]
    UnknownStatus(String),

    #[error("CM023: Task executor has stopped.")]
    Stopped,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid task payload: {0}")]
    Payload(#[from] serde_json::Error),
}
