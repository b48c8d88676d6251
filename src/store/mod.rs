//! Task store trait, generic implementation, and storage backends.
//!
//! # Architecture
//!
//! The task storage system has three layers:
//!
//! 1. **[`TaskStore`]** -- A type-erasure interface for use as
//!    `Arc<dyn TaskStore>` by the dispatcher, runner and lifecycle
//!    controller.
//!
//! 2. **[`GenericTaskStore<B>`](generic::GenericTaskStore)** -- All domain
//!    logic (state machine, `from`-status precondition, timestamp rules,
//!    serialization at the storage boundary). Has a blanket `TaskStore` impl.
//!
//! 3. **[`StorageBackend`]** -- Dumb versioned KV trait that backends
//!    implement. No domain logic.
//!
//! # Backends
//!
//! - [`InMemoryBackend`](memory::InMemoryBackend) -- `DashMap`-backed, for
//!   tests and single-process deployments.
//! - `RedisBackend` -- Lua-scripted atomic writes shared by independent
//!   processes. Available behind the `redis` feature flag.

pub mod backend;
pub mod generic;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use serde_json::Value;

pub use backend::{StorageBackend, StorageError, VersionedRecord};
pub use generic::GenericTaskStore;
pub use memory::{InMemoryBackend, InMemoryTaskStore};

use crate::domain::{TaskRecord, TransitionFields};
use crate::error::TaskError;
use crate::types::task::TaskStatus;

/// Durable record of every task and its current state.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one store handle is shared by every
/// controller and runner in a process.
///
/// # Atomicity
///
/// [`transition`](TaskStore::transition) is a single conditional write: it
/// succeeds only if the stored status still equals `from` at the moment of
/// the write. Two concurrent attempts to leave the same status race and
/// exactly one wins.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Creates a new task in the `Pending` state under the given id.
    ///
    /// # Errors
    ///
    /// - [`TaskError::Conflict`] if the id already exists.
    /// - [`TaskError::TransientStorage`] on backend failures.
    async fn create(
        &self,
        task_id: &str,
        payload: Value,
        idempotency_key: Option<&str>,
    ) -> Result<TaskRecord, TaskError>;

    /// Retrieves a task by id.
    ///
    /// # Errors
    ///
    /// - [`TaskError::NotFound`] if no task with the given id exists.
    /// - [`TaskError::TransientStorage`] on backend failures.
    async fn get(&self, task_id: &str) -> Result<TaskRecord, TaskError>;

    /// Moves a task from `from` to `to`, writing `fields` in the same update.
    ///
    /// # Errors
    ///
    /// - [`TaskError::InvalidTransition`] if `from -> to` is not an edge of
    ///   the state machine (this includes every edge out of a terminal state).
    /// - [`TaskError::Conflict`] if the current status is not `from`, or a
    ///   concurrent write won the race.
    /// - [`TaskError::NotFound`] if the task does not exist.
    /// - [`TaskError::TransientStorage`] on backend failures.
    async fn transition(
        &self,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        fields: TransitionFields,
    ) -> Result<TaskRecord, TaskError>;

    /// Deletes a `Pending` task that lost its idempotency reservation.
    ///
    /// Returns `false` if the task was already gone.
    ///
    /// # Errors
    ///
    /// - [`TaskError::Conflict`] if the task is no longer `Pending`.
    /// - [`TaskError::TransientStorage`] on backend failures.
    async fn discard(&self, task_id: &str) -> Result<bool, TaskError>;

    /// Lists every task currently in `status`, oldest first.
    ///
    /// # Errors
    ///
    /// - [`TaskError::TransientStorage`] on backend failures.
    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, TaskError>;
}

#[async_trait]
impl<B: StorageBackend + 'static> TaskStore for GenericTaskStore<B> {
    async fn create(
        &self,
        task_id: &str,
        payload: Value,
        idempotency_key: Option<&str>,
    ) -> Result<TaskRecord, TaskError> {
        GenericTaskStore::create(self, task_id, payload, idempotency_key).await
    }

    async fn get(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        GenericTaskStore::get(self, task_id).await
    }

    async fn transition(
        &self,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        fields: TransitionFields,
    ) -> Result<TaskRecord, TaskError> {
        GenericTaskStore::transition(self, task_id, from, to, fields).await
    }

    async fn discard(&self, task_id: &str) -> Result<bool, TaskError> {
        GenericTaskStore::discard(self, task_id).await
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, TaskError> {
        GenericTaskStore::list_by_status(self, status).await
    }
}
