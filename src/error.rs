//! Error types for the task store and the capability boundary.

use crate::types::TaskStatus;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Error codes for programmatic error handling and structured logs.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors
    DepthExceeded,
    InconsistentDepth,

    // State machine
    InvalidTransition,
    TaskNotFound,
    OrphanedTask,

    // Run lifecycle
    RunActive,
    NotRunning,

    // Internal errors
    DatabaseError,
    MigrationError,
    SerializationError,
    CorruptRow,
    InternalError,
}

/// Errors raised by the task store and the queue runtime.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("depth {depth} exceeds max depth {max_depth}")]
    DepthExceeded { depth: u32, max_depth: u32 },

    #[error("depth {depth} does not follow parent {parent_task_id} at depth {parent_depth}")]
    InconsistentDepth {
        depth: u32,
        parent_task_id: String,
        parent_depth: u32,
    },

    #[error("task {task_id}: cannot transition from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task {task_id} has been running for {running_for_secs}s without completing")]
    OrphanedTask {
        task_id: String,
        running_for_secs: i64,
    },

    #[error("a run is already active")]
    RunActive,

    #[error("no run is active")]
    NotRunning,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("migration error: {0}")]
    Migration(#[from] refinery::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt task row: {0}")]
    CorruptRow(String),

    #[error("database connection lock poisoned")]
    LockPoisoned,
}

impl QueueError {
    pub fn code(&self) -> ErrorCode {
        match self {
            QueueError::DepthExceeded { .. } => ErrorCode::DepthExceeded,
            QueueError::InconsistentDepth { .. } => ErrorCode::InconsistentDepth,
            QueueError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            QueueError::TaskNotFound(_) => ErrorCode::TaskNotFound,
            QueueError::OrphanedTask { .. } => ErrorCode::OrphanedTask,
            QueueError::RunActive => ErrorCode::RunActive,
            QueueError::NotRunning => ErrorCode::NotRunning,
            QueueError::Database(_) => ErrorCode::DatabaseError,
            QueueError::Migration(_) => ErrorCode::MigrationError,
            QueueError::Serialization(_) => ErrorCode::SerializationError,
            QueueError::CorruptRow(_) => ErrorCode::CorruptRow,
            QueueError::LockPoisoned => ErrorCode::InternalError,
        }
    }

    pub fn invalid_transition(task_id: &str, from: TaskStatus, to: TaskStatus) -> Self {
        QueueError::InvalidTransition {
            task_id: task_id.to_string(),
            from,
            to,
        }
    }

    /// Errors a worker logs and moves past, as opposed to store failures.
    pub fn is_state_conflict(&self) -> bool {
        matches!(
            self,
            QueueError::InvalidTransition { .. } | QueueError::TaskNotFound(_)
        )
    }
}

/// Result type for store and runtime operations.
pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Failure reported by (or imposed on) the capability collaborator.
#[derive(Debug, Error)]
pub enum CapabilityFailure {
    #[error("capability failed: {0}")]
    Failed(String),

    #[error("capability timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("capability exceeded step limit of {max_steps}")]
    StepLimitExceeded { max_steps: u32 },

    #[error("capability i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("capability protocol error: {0}")]
    Protocol(String),
}

impl CapabilityFailure {
    pub fn failed(message: impl Into<String>) -> Self {
        CapabilityFailure::Failed(message.into())
    }
}
