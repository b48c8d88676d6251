//! Persist-then-enqueue delivery and the stale `PENDING` reconciliation sweep.
//!
//! The dispatcher only ever publishes ids of tasks that already exist in the
//! store. A publish that fails leaves the task `PENDING`;
//! [`Dispatcher::requeue_stale`] finds it later and publishes it again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::domain::TaskRecord;
use crate::error::TaskError;
use crate::idempotency::{IdempotencyIndex, Reservation};
use crate::queue::{QueueEntry, WorkQueue};
use crate::store::TaskStore;
use crate::types::task::TaskStatus;

/// Hands tasks to the work queue.
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    index: Arc<dyn IdempotencyIndex>,
    queue: Arc<dyn WorkQueue>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

/// Converts a std duration into a cutoff instant `older_than` ago.
pub(crate) fn cutoff(older_than: Duration) -> Result<chrono::DateTime<Utc>, TaskError> {
    let delta = chrono::Duration::from_std(older_than)
        .map_err(|_| TaskError::InvalidInput(format!("threshold {older_than:?} out of range")))?;
    Ok(Utc::now() - delta)
}

impl Dispatcher {
    /// Creates a dispatcher over explicitly constructed handles.
    pub fn new(
        store: Arc<dyn TaskStore>,
        index: Arc<dyn IdempotencyIndex>,
        queue: Arc<dyn WorkQueue>,
    ) -> Self {
        Self {
            store,
            index,
            queue,
        }
    }

    /// Publishes a delivery notice for a task that is already persisted.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::TransientStorage`] if the queue rejects the notice.
    pub async fn enqueue(&self, task_id: &str) -> Result<(), TaskError> {
        self.queue.enqueue(QueueEntry::new(task_id)).await?;
        tracing::debug!(task_id = task_id, "task enqueued");
        Ok(())
    }

    /// Re-publishes every `PENDING` task queued more than `older_than` ago.
    ///
    /// A keyed record is only published once it owns its key. If the index
    /// has no entry for the key yet (its submission is still between create
    /// and reserve, or crashed there), the sweep reserves the key for it.
    /// Records whose key belongs to another task are discarded instead.
    /// Returns the number of tasks re-published.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::TransientStorage`] if the store cannot be listed
    /// or the queue rejects a notice.
    pub async fn requeue_stale(&self, older_than: Duration) -> Result<usize, TaskError> {
        let cutoff = cutoff(older_than)?;
        let pending = self.store.list_by_status(TaskStatus::Pending).await?;

        let mut requeued = 0;
        for record in pending.iter().filter(|r| r.queued_at <= cutoff) {
            if !self.owns_key(record).await? {
                match self.store.discard(&record.task_id).await {
                    Ok(_) => {
                        tracing::warn!(task_id = %record.task_id, "discarded orphaned task");
                    },
                    Err(e) if e.is_conflict() => {
                        tracing::debug!(task_id = %record.task_id, "orphan moved before discard");
                    },
                    Err(e) => return Err(e),
                }
                continue;
            }

            self.enqueue(&record.task_id).await?;
            tracing::warn!(
                task_id = %record.task_id,
                queued_at = %record.queued_at,
                "requeued stale pending task"
            );
            requeued += 1;
        }
        Ok(requeued)
    }

    async fn owns_key(&self, record: &TaskRecord) -> Result<bool, TaskError> {
        let Some(key) = record.idempotency_key.as_deref() else {
            return Ok(true);
        };
        let owner = match self.index.lookup(key).await? {
            Some(owner) => owner,
            None => match self.index.reserve(key, &record.task_id).await? {
                Reservation::Reserved => {
                    tracing::debug!(task_id = %record.task_id, "reserved key for stale task");
                    return Ok(true);
                },
                Reservation::Existing(owner) => owner,
            },
        };
        Ok(owner == record.task_id)
    }
}
