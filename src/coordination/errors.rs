use std::time::Duration;
use thiserror::Error;

use super::types::TaskStatus;

/// Errors raised by the file-based lock manager
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock '{lock}' is busy (held by {holder:?}); gave up after {waited:?}")]
    Busy {
        lock: String,
        holder: Option<String>,
        waited: Duration,
    },

    #[error("IO error on lock '{lock}': {source}")]
    Io {
        lock: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the coordination protocol and its storage layers
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Invalid transition for task {task_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {task_id} is not assigned to agent {agent_id}")]
    NotAssigned { task_id: String, agent_id: String },

    #[error("Projection {path} is corrupt: {reason}")]
    CorruptProjection { path: String, reason: String },
}

impl CoordinationError {
    /// True when the failure is transient lock contention and the caller may retry
    pub fn is_busy(&self) -> bool {
        matches!(self, CoordinationError::Lock(LockError::Busy { .. }))
    }
}

pub type Result<T, E = CoordinationError> = std::result::Result<T, E>;
