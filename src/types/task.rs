//! Task status state machine and the caller-facing task view.
//!
//! # Serialization
//!
//! [`TaskStatus`] serializes as an upper-case string (`"PENDING"`,
//! `"PROCESSING"`, `"COMPLETED"`, `"FAILED"`). Any other string is rejected,
//! both by serde and by [`FromStr`], so an unknown status can never enter the
//! store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TaskError;

/// Task lifecycle status.
///
/// # State Machine
///
/// ```text
/// Pending    -> Processing
/// Processing -> Completed, Failed
/// Completed  -> (terminal, no transitions)
/// Failed     -> (terminal, no transitions)
/// ```
///
/// The only backward edge is `Processing -> Pending`, reserved for stale
/// recovery of tasks whose worker died (see [`can_recover_to`](Self::can_recover_to)).
///
/// # Examples
///
/// ```
/// use async_tasks::TaskStatus;
///
/// let status = TaskStatus::Pending;
/// assert!(!status.is_terminal());
/// assert!(status.can_transition_to(&TaskStatus::Processing));
/// assert!(!status.can_transition_to(&TaskStatus::Completed));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Created and waiting for a worker to claim it.
    Pending,
    /// Claimed by a worker and executing.
    Processing,
    /// Finished successfully (terminal).
    Completed,
    /// Finished with an error (terminal).
    Failed,
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
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(TaskError::InvalidInput(format!(
                "unknown task status: {other}"
            ))),
        }
    }
}

impl TaskStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [TaskStatus; 4] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
    ];

    /// The wire spelling of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Returns `true` if this status is terminal (no further transitions allowed).
    ///
    /// # Examples
    ///
    /// ```
    /// use async_tasks::TaskStatus;
    ///
    /// assert!(!TaskStatus::Pending.is_terminal());
    /// assert!(!TaskStatus::Processing.is_terminal());
    /// assert!(TaskStatus::Completed.is_terminal());
    /// assert!(TaskStatus::Failed.is_terminal());
    /// ```
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position along the lifecycle; terminal states share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Returns `true` if moving forward from this status to `next` is valid.
    ///
    /// Self-transitions are rejected.
    ///
    /// # Examples
    ///
    /// ```
    /// use async_tasks::TaskStatus;
    ///
    /// assert!(TaskStatus::Processing.can_transition_to(&TaskStatus::Failed));
    /// assert!(!TaskStatus::Completed.can_transition_to(&TaskStatus::Processing));
    /// assert!(!TaskStatus::Pending.can_transition_to(&TaskStatus::Pending));
    /// ```
    pub fn can_transition_to(&self, next: &Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Processing),
            Self::Processing => matches!(next, Self::Completed | Self::Failed),
            Self::Completed | Self::Failed => false,
        }
    }

    /// Returns `true` for the recovery edge `Processing -> Pending`.
    ///
    /// A watchdog uses this edge to hand a task whose worker stopped
    /// reporting back to the queue.
    pub fn can_recover_to(&self, next: &Self) -> bool {
        matches!((self, next), (Self::Processing, Self::Pending))
    }

    /// Validates the edge from this status to `next`.
    ///
    /// Accepts forward transitions and the recovery edge; anything else is a
    /// [`TaskError::InvalidTransition`].
    ///
    /// # Examples
    ///
    /// ```
    /// use async_tasks::TaskStatus;
    ///
    /// assert!(TaskStatus::Pending
    ///     .validate_transition("task-123", &TaskStatus::Processing)
    ///     .is_ok());
    /// assert!(TaskStatus::Failed
    ///     .validate_transition("task-123", &TaskStatus::Pending)
    ///     .is_err());
    /// ```
    pub fn validate_transition(&self, task_id: &str, next: &Self) -> Result<(), TaskError> {
        if self.can_transition_to(next) || self.can_recover_to(next) {
            Ok(())
        } else {
            Err(TaskError::InvalidTransition {
                task_id: task_id.to_string(),
                from: *self,
                to: *next,
            })
        }
    }
}

/// What a status lookup returns: the literal persisted state of a task.
///
/// Timestamps are RFC 3339 strings with millisecond precision. `result` is
/// opaque; a handler that uploads large output elsewhere returns a reference
/// (for example a URL string) and that reference is what appears here.
///
/// # Examples
///
/// ```
/// use async_tasks::{TaskStatus, TaskView};
///
/// let view = TaskView {
///     task_id: "abc-123".to_string(),
///     status: TaskStatus::Failed,
///     queued_at: "2026-01-05T10:30:00.000Z".to_string(),
///     started_at: Some("2026-01-05T10:30:01.000Z".to_string()),
///     finished_at: Some("2026-01-05T10:30:02.000Z".to_string()),
///     result: None,
///     error: Some("language not supported".to_string()),
/// };
///
/// let json = serde_json::to_value(&view).unwrap();
/// assert_eq!(json["task_id"], "abc-123");
/// assert_eq!(json["status"], "FAILED");
/// assert!(json.get("result").is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    /// Unique identifier for this task.
    pub task_id: String,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// When the task was accepted.
    pub queued_at: String,

    /// When a worker first claimed the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    /// When the task reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,

    /// Handler output (or a reference to it) once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Failure message once failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
