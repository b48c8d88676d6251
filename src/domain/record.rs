//! Task record -- the store's internal representation of a task.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::task::{TaskStatus, TaskView};

/// Formats a timestamp the way every caller-facing view does.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Internal storage representation of a task.
///
/// All fields are public so that store implementors have full access.
/// `version` is the backend's CAS counter; it is filled in after every read
/// or write and never serialized.
///
/// # Construction
///
/// ```
/// use async_tasks::domain::TaskRecord;
/// use async_tasks::TaskStatus;
/// use serde_json::json;
///
/// let record = TaskRecord::new(
///     TaskRecord::generate_id(),
///     json!({"text": "hello"}),
///     Some("key-1".to_string()),
/// );
/// assert_eq!(record.status, TaskStatus::Pending);
/// assert!(record.started_at.is_none());
/// assert_eq!(record.attempts, 0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Globally unique, immutable task identifier.
    pub task_id: String,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Opaque input handed to the unit of work.
    pub payload: Value,

    /// Handler output, set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Failure message, set on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Idempotency key the task was submitted under, if any. Lets sweeps
    /// tell a reserved task from an orphan that lost its reservation race.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    /// Number of successful claims.
    #[serde(default)]
    pub attempts: u32,

    /// When the task was created.
    pub queued_at: DateTime<Utc>,

    /// First claim. Never overwritten, even after recovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Most recent claim; the staleness clock for stuck `Processing` tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Backend CAS version of the stored bytes this record was read from.
    #[serde(skip)]
    pub version: u64,
}

impl TaskRecord {
    /// Creates a new record in the `Pending` state, queued now.
    pub fn new(task_id: String, payload: Value, idempotency_key: Option<String>) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            payload,
            result: None,
            error: None,
            idempotency_key,
            attempts: 0,
            queued_at: Utc::now(),
            started_at: None,
            claimed_at: None,
            finished_at: None,
            version: 0,
        }
    }

    /// Generates a fresh `UUIDv4` task id.
    pub fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Applies a validated transition to `to` at time `now`.
    ///
    /// The caller has already checked the edge. Timestamps follow these rules:
    ///
    /// - `started_at` is set on the first move to `Processing` only.
    /// - `claimed_at` tracks the latest claim and is cleared on recovery.
    /// - `finished_at` is set on the move to a terminal state, never earlier
    ///   than `started_at`.
    pub fn apply_transition(&mut self, to: TaskStatus, fields: TransitionFields, now: DateTime<Utc>) {
        let now = fields.at.unwrap_or(now);
        match to {
            TaskStatus::Processing => {
                if self.started_at.is_none() {
                    self.started_at = Some(now.max(self.queued_at));
                }
                self.claimed_at = Some(now);
                self.attempts = self.attempts.saturating_add(1);
            },
            TaskStatus::Pending => {
                self.claimed_at = None;
            },
            TaskStatus::Completed | TaskStatus::Failed => {
                let floor = self.started_at.unwrap_or(self.queued_at);
                self.finished_at = Some(now.max(floor));
                self.claimed_at = None;
            },
        }
        if let Some(result) = fields.result {
            self.result = Some(result);
        }
        if let Some(error) = fields.error {
            self.error = Some(error);
        }
        self.status = to;
    }

    /// Converts the record to the caller-facing view.
    pub fn to_view(&self) -> TaskView {
        TaskView {
            task_id: self.task_id.clone(),
            status: self.status,
            queued_at: format_timestamp(&self.queued_at),
            started_at: self.started_at.as_ref().map(format_timestamp),
            finished_at: self.finished_at.as_ref().map(format_timestamp),
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

/// Fields written together with a status change.
///
/// # Examples
///
/// ```
/// use async_tasks::TransitionFields;
/// use serde_json::json;
///
/// let fields = TransitionFields::completed(json!("HELLO"));
/// assert_eq!(fields.result, Some(json!("HELLO")));
/// assert!(fields.error.is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionFields {
    /// Result to record (completion).
    pub result: Option<Value>,
    /// Error to record (failure).
    pub error: Option<String>,
    /// Explicit transition time; defaults to the store's clock.
    pub at: Option<DateTime<Utc>>,
    /// Claim the writer holds, as the `attempts` value it was granted.
    /// When set, the store rejects the write if the task has been claimed
    /// again since.
    pub claim: Option<u32>,
}

impl TransitionFields {
    /// No extra fields; used for claims and recovery.
    pub fn none() -> Self {
        Self::default()
    }

    /// Fields for a successful completion.
    pub fn completed(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    /// Fields for a failure.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Pins the transition time.
    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }

    /// Fences the write to the claim that returned `attempts`.
    pub fn for_claim(mut self, attempts: u32) -> Self {
        self.claim = Some(attempts);
        self
    }
}
