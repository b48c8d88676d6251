//! Error types for task lifecycle operations.
//!
//! Provides [`TaskError`], the error taxonomy shared by the store, the
//! idempotency index, the dispatcher and the runner, together with the
//! transport status mapping used by whatever HTTP layer sits on top.

use thiserror::Error;

use crate::types::task::TaskStatus;

/// Errors that can occur during task operations.
///
/// Each variant carries enough context (task id, statuses) to log without
/// re-reading the store. Use [`http_status`](TaskError::http_status) to map
/// to a transport status code.
///
/// # Examples
///
/// ```
/// use async_tasks::TaskError;
///
/// let err = TaskError::NotFound {
///     task_id: "missing-task".to_string(),
/// };
/// assert_eq!(err.http_status(), 404);
/// assert!(err.to_string().contains("missing-task"));
/// ```
#[derive(Debug, Error)]
pub enum TaskError {
    /// Task with the given ID was not found.
    #[error("task not found: {task_id}")]
    NotFound {
        /// The task ID that was not found.
        task_id: String,
    },

    /// A precondition on the stored record did not hold: the task id already
    /// exists, or the current status is not the expected `from` status.
    #[error("conflict on task {task_id}: {reason}")]
    Conflict {
        /// The task that was being written.
        task_id: String,
        /// What did not match.
        reason: String,
    },

    /// The requested edge is not part of the state machine.
    #[error("invalid transition from {from} to {to} for task {task_id}")]
    InvalidTransition {
        /// The task that was being transitioned.
        task_id: String,
        /// The status the caller expected to leave.
        from: TaskStatus,
        /// The target status that was rejected.
        to: TaskStatus,
    },

    /// The unit of work returned an error or panicked.
    #[error("execution failed for task {task_id}: {message}")]
    ExecutionFailure {
        /// The task whose execution failed.
        task_id: String,
        /// The failure as reported by the handler.
        message: String,
    },

    /// The store or queue could not be reached. Callers retry with backoff.
    #[error("transient storage error: {message}")]
    TransientStorage {
        /// Human-readable description of the failure.
        message: String,
    },

    /// The caller supplied something unusable (e.g. an empty idempotency key).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A stored record could not be encoded or decoded.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TaskError {
    /// Returns `true` for errors that mean "someone else already moved this
    /// task": a failed `from` precondition, a lost CAS race, or an edge out
    /// of a terminal state.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::InvalidTransition { .. })
    }

    /// Returns `true` if retrying the same operation may succeed.
    ///
    /// Only [`TaskError::TransientStorage`] is retryable; execution failures
    /// are recorded on the task and never retried by this crate.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStorage { .. })
    }

    /// Maps this error to an HTTP status code for the transport layer.
    ///
    /// - `404`: `NotFound`
    /// - `409`: `Conflict`, `InvalidTransition`
    /// - `400`: `InvalidInput`
    /// - `503`: `TransientStorage`
    /// - `500`: `ExecutionFailure`, `Internal`
    ///
    /// # Examples
    ///
    /// ```
    /// use async_tasks::{TaskError, TaskStatus};
    ///
    /// let err = TaskError::InvalidTransition {
    ///     task_id: "t1".to_string(),
    ///     from: TaskStatus::Completed,
    ///     to: TaskStatus::Processing,
    /// };
    /// assert_eq!(err.http_status(), 409);
    ///
    /// let err = TaskError::TransientStorage { message: "redis timeout".into() };
    /// assert_eq!(err.http_status(), 503);
    /// ```
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } | Self::InvalidTransition { .. } => 409,
            Self::InvalidInput(_) => 400,
            Self::TransientStorage { .. } => 503,
            Self::ExecutionFailure { .. } | Self::Internal(_) => 500,
        }
    }
}
