//! Submission, status lookup and stale recovery.
//!
//! [`LifecycleController::submit`] is the only way tasks come into
//! existence. With an idempotency key it runs lookup → create → reserve →
//! enqueue:
//!
//! - the fast path returns an existing task without writing anything;
//! - two racing submissions both create a record, but only one reserves the
//!   key, and the loser discards its record and answers with the winner;
//! - an enqueue failure is swallowed, since the task is already durable and
//!   [`requeue_stale`](LifecycleController::requeue_stale) will publish it.
//!
//! A crash between create and reserve leaves an unreserved record behind.
//! The requeue sweep reserves the key on its behalf and publishes it, so the
//! sweep and a slow submission agree on the same owner.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::dispatcher::{cutoff, Dispatcher};
use crate::domain::{TaskRecord, TransitionFields};
use crate::error::TaskError;
use crate::idempotency::{validate_key, IdempotencyIndex, Reservation};
use crate::store::TaskStore;
use crate::types::params::{SubmitRequest, SubmitResponse};
use crate::types::task::{TaskStatus, TaskView};

/// Front door for transports: submit tasks and read their state.
pub struct LifecycleController {
    store: Arc<dyn TaskStore>,
    index: Arc<dyn IdempotencyIndex>,
    dispatcher: Arc<Dispatcher>,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

fn existing(record: &TaskRecord) -> SubmitResponse {
    SubmitResponse {
        task_id: record.task_id.clone(),
        status: record.status,
        created: false,
    }
}

impl LifecycleController {
    /// Creates a controller over explicitly constructed handles.
    pub fn new(
        store: Arc<dyn TaskStore>,
        index: Arc<dyn IdempotencyIndex>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            store,
            index,
            dispatcher,
        }
    }

    /// Accepts a unit of work and returns the task it resolved to.
    ///
    /// Repeating a submission with the same `idempotency_key` always returns
    /// the same task id, with `created = false`, no matter how many copies
    /// race.
    ///
    /// # Errors
    ///
    /// - [`TaskError::InvalidInput`] if the key is empty or too long.
    /// - [`TaskError::TransientStorage`] if the store or index is
    ///   unreachable. Queue failures are not reported.
    ///
    /// # Examples
    ///
    /// ```
    /// use async_tasks::{handler_fn, TaskRuntime, TasksConfig, TaskStatus};
    /// use serde_json::json;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let runtime = TaskRuntime::from_config(
    ///     &TasksConfig::default(),
    ///     handler_fn(|payload| async move { Ok(payload) }),
    /// )
    /// .await
    /// .unwrap();
    ///
    /// let first = runtime.controller().submit(Some("k-1"), json!({"n": 1})).await.unwrap();
    /// let again = runtime.controller().submit(Some("k-1"), json!({"n": 1})).await.unwrap();
    /// assert!(first.created);
    /// assert!(!again.created);
    /// assert_eq!(first.task_id, again.task_id);
    /// assert_eq!(again.status, TaskStatus::Pending);
    /// # }
    /// ```
    pub async fn submit(
        &self,
        idempotency_key: Option<&str>,
        payload: Value,
    ) -> Result<SubmitResponse, TaskError> {
        if let Some(key) = idempotency_key {
            validate_key(key)?;
            if let Some(task_id) = self.index.lookup(key).await? {
                let record = self.store.get(&task_id).await?;
                tracing::debug!(task_id = %task_id, "idempotent replay");
                return Ok(existing(&record));
            }
        }

        let task_id = TaskRecord::generate_id();
        let record = self.store.create(&task_id, payload, idempotency_key).await?;

        if let Some(key) = idempotency_key {
            // A failure here leaves an unreserved record for the sweep. The
            // sweep may also have reserved the key for this record already.
            if let Reservation::Existing(winner) = self.index.reserve(key, &task_id).await? {
                if winner != task_id {
                    tracing::debug!(
                        task_id = %task_id,
                        winner = %winner,
                        "lost idempotency race, discarding duplicate"
                    );
                    if let Err(e) = self.store.discard(&task_id).await {
                        tracing::warn!(task_id = %task_id, error = %e, "failed to discard duplicate task");
                    }
                    let winner = self.store.get(&winner).await?;
                    return Ok(existing(&winner));
                }
            }
        }

        if let Err(e) = self.dispatcher.enqueue(&task_id).await {
            tracing::warn!(
                task_id = %task_id,
                error = %e,
                "enqueue failed, task left for requeue sweep"
            );
        }

        Ok(SubmitResponse {
            task_id,
            status: record.status,
            created: true,
        })
    }

    /// Convenience wrapper that submits a [`SubmitRequest`] payload.
    pub async fn submit_request(
        &self,
        idempotency_key: Option<&str>,
        request: SubmitRequest,
    ) -> Result<SubmitResponse, TaskError> {
        self.submit(idempotency_key, request.into_payload()).await
    }

    /// Returns the caller-facing view of a task.
    ///
    /// # Errors
    ///
    /// [`TaskError::NotFound`] for an unknown id.
    pub async fn get_status(&self, task_id: &str) -> Result<TaskView, TaskError> {
        Ok(self.store.get(task_id).await?.to_view())
    }

    /// Re-publishes `PENDING` tasks older than `older_than`.
    ///
    /// See [`Dispatcher::requeue_stale`].
    pub async fn requeue_stale(&self, older_than: Duration) -> Result<usize, TaskError> {
        self.dispatcher.requeue_stale(older_than).await
    }

    /// Hands `PROCESSING` tasks whose last claim is older than `timeout` back
    /// to `PENDING` and re-publishes them. Returns the number recovered.
    ///
    /// The handler of a recovered task may still be running; its terminal
    /// write will then fail with a conflict and be discarded.
    ///
    /// # Errors
    ///
    /// [`TaskError::TransientStorage`] if the store cannot be listed or
    /// written. Publish failures are logged and left for the requeue sweep.
    pub async fn recover_stale(&self, timeout: Duration) -> Result<usize, TaskError> {
        let cutoff = cutoff(timeout)?;
        let processing = self.store.list_by_status(TaskStatus::Processing).await?;

        let mut recovered = 0;
        for record in processing {
            let Some(claimed_at) = record.claimed_at.or(record.started_at) else {
                continue;
            };
            if claimed_at > cutoff {
                continue;
            }

            match self
                .store
                .transition(
                    &record.task_id,
                    TaskStatus::Processing,
                    TaskStatus::Pending,
                    TransitionFields::none(),
                )
                .await
            {
                Ok(_) => {
                    tracing::warn!(
                        task_id = %record.task_id,
                        claimed_at = %claimed_at,
                        attempts = record.attempts,
                        "recovered stuck task"
                    );
                    recovered += 1;
                },
                Err(e) if e.is_conflict() => {
                    tracing::debug!(task_id = %record.task_id, "task finished before recovery");
                    continue;
                },
                Err(e) => return Err(e),
            }

            if let Err(e) = self.dispatcher.enqueue(&record.task_id).await {
                tracing::warn!(
                    task_id = %record.task_id,
                    error = %e,
                    "enqueue after recovery failed, task left for requeue sweep"
                );
            }
        }
        Ok(recovered)
    }
}
