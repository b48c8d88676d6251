//! Execution runner: claim, execute, complete or fail, plus the worker loop.
//!
//! # Exactly-once visible effect
//!
//! Deliveries are at-least-once, so the same task id can reach several
//! workers. [`ExecutionRunner::claim`] is a `PENDING -> PROCESSING`
//! transition on the store: exactly one worker wins and every other one
//! sees a conflict and drops the delivery. The terminal write is also
//! conditional (`PROCESSING -> COMPLETED/FAILED`) and fenced to the claim's
//! `attempts`, so a worker whose task was recovered and reclaimed elsewhere
//! cannot overwrite the newer outcome, even though the task is `PROCESSING`
//! again.
//!
//! # Worker pool
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_tasks::runner::{handler_fn, ExecutionRunner};
//! use async_tasks::store::{GenericTaskStore, InMemoryBackend};
//! use async_tasks::queue::InMemoryWorkQueue;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let runner = Arc::new(ExecutionRunner::new(
//!     Arc::new(GenericTaskStore::new(InMemoryBackend::new())),
//!     Arc::new(InMemoryWorkQueue::new()),
//!     Arc::new(handler_fn(|payload| async move { Ok(payload) })),
//! ));
//! let shutdown = CancellationToken::new();
//! let workers = runner.spawn_workers(4, shutdown.clone());
//! shutdown.cancel();
//! for worker in workers {
//!     worker.await.unwrap();
//! }
//! # }
//! ```

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::{TaskRecord, TransitionFields};
use crate::error::TaskError;
use crate::queue::WorkQueue;
use crate::retry::{retry_transient, RetryPolicy};
use crate::store::TaskStore;
use crate::types::task::TaskStatus;

/// The opaque unit of work a task runs.
///
/// An `Err` is recorded on the task as its failure message. Handlers are
/// never retried by the runner.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Runs the work for one task.
    async fn handle(&self, payload: &Value) -> Result<Value, String>;
}

/// Boxed future returned by a closure handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;

/// A [`TaskHandler`] backed by a closure. Build one with [`handler_fn`].
#[derive(Clone)]
pub struct FnHandler {
    f: Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>,
}

impl std::fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

/// Wraps an async closure as a [`TaskHandler`].
///
/// # Examples
///
/// ```
/// use async_tasks::{handler_fn, TaskHandler};
/// use serde_json::{json, Value};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let upper = handler_fn(|payload: Value| async move {
///     let text = payload["text"].as_str().ok_or("missing text")?;
///     Ok(json!(text.to_uppercase()))
/// });
/// assert_eq!(upper.handle(&json!({"text": "hi"})).await.unwrap(), json!("HI"));
/// # }
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    FnHandler {
        f: Arc::new(move |payload: Value| Box::pin(f(payload)) as HandlerFuture),
    }
}

#[async_trait]
impl TaskHandler for FnHandler {
    async fn handle(&self, payload: &Value) -> Result<Value, String> {
        (self.f)(payload.clone()).await
    }
}

/// What [`ExecutionRunner::process`] did with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The handler succeeded and the task is `COMPLETED`.
    Completed,
    /// The handler failed and the task is `FAILED`.
    Failed,
    /// Another worker owns the task, or it no longer exists.
    Skipped,
}

const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(500);

/// Claims and runs tasks delivered through the work queue.
pub struct ExecutionRunner {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn WorkQueue>,
    handler: Arc<dyn TaskHandler>,
    retry: RetryPolicy,
    idle_wait: Duration,
}

impl std::fmt::Debug for ExecutionRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionRunner")
            .field("retry", &self.retry)
            .field("idle_wait", &self.idle_wait)
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl ExecutionRunner {
    /// Creates a runner with the default retry policy and idle wait.
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn WorkQueue>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        Self {
            store,
            queue,
            handler,
            retry: RetryPolicy::default(),
            idle_wait: DEFAULT_IDLE_WAIT,
        }
    }

    /// Sets the retry policy for the terminal write.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets how long an idle worker waits on the queue per poll.
    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    /// Like [`claim`](Self::claim), but returns the claimed record. Its
    /// `attempts` identifies this claim to [`complete`](Self::complete) and
    /// [`fail`](Self::fail).
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::TransientStorage`] if the store is unreachable.
    pub async fn try_claim(&self, task_id: &str) -> Result<Option<TaskRecord>, TaskError> {
        match self
            .store
            .transition(
                task_id,
                TaskStatus::Pending,
                TaskStatus::Processing,
                TransitionFields::none(),
            )
            .await
        {
            Ok(record) => {
                tracing::info!(task_id = task_id, attempts = record.attempts, "task claimed");
                Ok(Some(record))
            },
            Err(e) if e.is_conflict() => {
                tracing::debug!(task_id = task_id, reason = %e, "claim lost, task handled elsewhere");
                Ok(None)
            },
            // A delivery for a record that was discarded as an orphan.
            Err(TaskError::NotFound { .. }) => {
                tracing::debug!(task_id = task_id, "claim skipped, task no longer exists");
                Ok(None)
            },
            Err(e) => Err(e),
        }
    }

    /// Moves a task from `PENDING` to `PROCESSING`.
    ///
    /// Returns `false` if another worker got there first (or the task has
    /// already finished); the caller must then drop the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::TransientStorage`] if the store is unreachable.
    pub async fn claim(&self, task_id: &str) -> Result<bool, TaskError> {
        Ok(self.try_claim(task_id).await?.is_some())
    }

    /// Invokes the handler on a claimed task.
    ///
    /// Handler errors and panics are both turned into
    /// [`TaskError::ExecutionFailure`].
    pub async fn execute(&self, task: &TaskRecord) -> Result<Value, TaskError> {
        let outcome = AssertUnwindSafe(self.handler.handle(&task.payload))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(TaskError::ExecutionFailure {
                task_id: task.task_id.clone(),
                message,
            }),
            Err(panic) => Err(TaskError::ExecutionFailure {
                task_id: task.task_id.clone(),
                message: format!("handler panicked: {}", panic_message(panic.as_ref())),
            }),
        }
    }

    /// Records a successful result: `PROCESSING -> COMPLETED`.
    ///
    /// `task` is the record [`claim`](Self::claim) returned; the write only
    /// lands while that claim is still the latest one.
    ///
    /// # Errors
    ///
    /// [`TaskError::Conflict`] if the task is no longer `PROCESSING` under
    /// this claim, or [`TaskError::TransientStorage`] once retries are
    /// exhausted.
    pub async fn complete(&self, task: &TaskRecord, result: Value) -> Result<TaskRecord, TaskError> {
        let record = retry_transient(&self.retry, || {
            self.store.transition(
                &task.task_id,
                TaskStatus::Processing,
                TaskStatus::Completed,
                TransitionFields::completed(result.clone()).for_claim(task.attempts),
            )
        })
        .await?;
        tracing::info!(task_id = %task.task_id, attempts = task.attempts, "task completed");
        Ok(record)
    }

    /// Records a failure: `PROCESSING -> FAILED`.
    ///
    /// # Errors
    ///
    /// Same as [`complete`](Self::complete).
    pub async fn fail(&self, task: &TaskRecord, error: &str) -> Result<TaskRecord, TaskError> {
        let record = retry_transient(&self.retry, || {
            self.store.transition(
                &task.task_id,
                TaskStatus::Processing,
                TaskStatus::Failed,
                TransitionFields::failed(error).for_claim(task.attempts),
            )
        })
        .await?;
        tracing::warn!(task_id = %task.task_id, error = error, "task failed");
        Ok(record)
    }

    /// Handles one delivery end to end: claim, execute, then complete or fail.
    ///
    /// # Errors
    ///
    /// Only storage failures surface here; execution failures are recorded
    /// on the task and reported as [`ProcessOutcome::Failed`].
    pub async fn process(&self, task_id: &str) -> Result<ProcessOutcome, TaskError> {
        let Some(task) = self.try_claim(task_id).await? else {
            return Ok(ProcessOutcome::Skipped);
        };

        let (written, outcome) = match self.execute(&task).await {
            Ok(result) => (self.complete(&task, result).await, ProcessOutcome::Completed),
            Err(TaskError::ExecutionFailure { message, .. }) => {
                (self.fail(&task, &message).await, ProcessOutcome::Failed)
            },
            Err(e) => (Err(e), ProcessOutcome::Failed),
        };

        match written {
            Ok(_) => Ok(outcome),
            Err(e) if e.is_conflict() => {
                tracing::warn!(
                    task_id = task_id,
                    reason = %e,
                    "task moved while executing, discarding outcome"
                );
                Ok(ProcessOutcome::Skipped)
            },
            Err(e) => {
                tracing::error!(task_id = task_id, error = %e, "failed to record task outcome");
                Err(e)
            },
        }
    }

    /// Pulls deliveries until `shutdown` fires or the queue is closed.
    ///
    /// A task already being processed when `shutdown` fires runs to
    /// completion first.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.worker_loop(0, shutdown).await;
    }

    /// Spawns `n` workers on the current runtime, all sharing `shutdown`.
    pub fn spawn_workers(self: &Arc<Self>, n: usize, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        tracing::info!(workers = n, "starting task workers");
        (0..n)
            .map(|worker_id| {
                let runner = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { runner.worker_loop(worker_id, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: CancellationToken) {
        tracing::debug!(worker_id = worker_id, "worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.queue.dequeue(self.idle_wait) => next,
            };

            match next {
                Ok(Some(entry)) => match self.process(&entry.task_id).await {
                    Ok(outcome) => {
                        tracing::trace!(
                            worker_id = worker_id,
                            task_id = %entry.task_id,
                            ?outcome,
                            "delivery handled"
                        );
                    },
                    // The task stays where it is; a sweep will pick it up.
                    Err(e) => {
                        tracing::warn!(
                            worker_id = worker_id,
                            task_id = %entry.task_id,
                            error = %e,
                            "delivery failed"
                        );
                    },
                },
                Ok(None) if self.queue.is_closed() => break,
                Ok(None) => {},
                Err(e) => {
                    tracing::warn!(worker_id = worker_id, error = %e, "dequeue failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.idle_wait) => {},
                    }
                },
            }
        }

        tracing::debug!(worker_id = worker_id, "worker stopped");
    }
}
