//! Work queue seam between the dispatcher and the execution runner.
//!
//! A queue carries ephemeral [`QueueEntry`] delivery notices. It is never a
//! source of truth: losing an entry only delays a task until the requeue
//! sweep finds it, and delivering one twice is harmless because claiming is
//! a CAS on the store.
//!
//! # Implementations
//!
//! - [`InMemoryWorkQueue`](memory::InMemoryWorkQueue) -- a `VecDeque` plus a
//!   `tokio::sync::Notify`, for tests and single-process deployments.
//! - `RedisWorkQueue` -- a Redis list shared by independent processes.
//!   Available behind the `redis` feature flag.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::TaskError;

pub use memory::InMemoryWorkQueue;

/// A delivery notice for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// The task to run.
    pub task_id: String,
    /// When the notice was published.
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    /// Creates a notice for `task_id`, stamped now.
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            enqueued_at: Utc::now(),
        }
    }
}

/// Errors raised by a [`WorkQueue`].
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue was closed and accepts no more entries.
    #[error("work queue is closed")]
    Closed,

    /// The broker could not be reached or rejected the command.
    #[error("queue backend error: {message}")]
    Backend {
        /// Human-readable description of the failure.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A message on the queue could not be encoded or decoded.
    #[error("queue codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<QueueError> for TaskError {
    fn from(err: QueueError) -> Self {
        TaskError::TransientStorage {
            message: err.to_string(),
        }
    }
}

/// Competing-consumers delivery channel.
///
/// Each entry is handed to exactly one [`dequeue`](WorkQueue::dequeue)
/// caller, though the same task id may be enqueued more than once.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Publishes a delivery notice.
    ///
    /// # Errors
    ///
    /// - [`QueueError::Closed`] after [`close`](WorkQueue::close).
    /// - [`QueueError::Backend`] if the broker is unreachable.
    async fn enqueue(&self, entry: QueueEntry) -> Result<(), QueueError>;

    /// Takes the next notice, waiting up to `wait` for one to arrive.
    ///
    /// Returns `Ok(None)` on timeout, or once the queue is closed and drained.
    async fn dequeue(&self, wait: Duration) -> Result<Option<QueueEntry>, QueueError>;

    /// Stops accepting entries and wakes every waiting consumer.
    async fn close(&self);

    /// Returns `true` once [`close`](WorkQueue::close) has been called.
    fn is_closed(&self) -> bool;

    /// Number of notices waiting.
    async fn len(&self) -> Result<usize, QueueError>;

    /// Returns `true` if no notices are waiting.
    async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }
}
