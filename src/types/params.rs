//! Submission request and response shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::DEFAULT_LANGUAGE;
use crate::types::task::TaskStatus;

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

/// A text-processing submission as a transport would decode it.
///
/// The core treats payloads as opaque JSON; this is the shape the text
/// handlers in front of it expect. `language` defaults to `"en"`.
///
/// # Examples
///
/// ```
/// use async_tasks::SubmitRequest;
///
/// let req: SubmitRequest = serde_json::from_str(r#"{"text": "hello"}"#).unwrap();
/// assert_eq!(req.language, "en");
/// assert_eq!(req.into_payload()["text"], "hello");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Input text.
    pub text: String,

    /// Language hint for the handler.
    #[serde(default = "default_language")]
    pub language: String,
}

impl SubmitRequest {
    /// Creates a request with the default language.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            language: default_language(),
        }
    }

    /// Converts the request into the opaque payload stored on the task.
    pub fn into_payload(self) -> Value {
        serde_json::json!({
            "text": self.text,
            "language": self.language,
        })
    }
}

/// Result of a submission.
///
/// Always carries a task id, even when the submission lost a race to an
/// identical one: `created` tells the caller whether this call made the task.
/// A transport typically answers `201` when `created` and `200` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// The task this submission resolved to.
    pub task_id: String,

    /// Current status of that task.
    pub status: TaskStatus,

    /// `false` when an earlier submission with the same key already exists.
    pub created: bool,
}
