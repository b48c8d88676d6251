//! Idempotency key -> task id index.
//!
//! The index has exactly one write primitive: an atomic create-if-absent.
//! Whoever inserts a key first owns it forever; every later reservation for
//! the same key is told which task won. Entries are never updated or
//! deleted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{IDEMPOTENCY_NAMESPACE, MAX_IDEMPOTENCY_KEY_LEN};
use crate::error::TaskError;
use crate::store::backend::{make_key, StorageBackend, StorageError};

/// Outcome of [`IdempotencyIndex::reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// This call inserted the key; the given task id now owns it.
    Reserved,
    /// The key was already taken. The contained task id is authoritative.
    Existing(String),
}

/// Maps caller-supplied idempotency keys to the task they produced.
#[async_trait]
pub trait IdempotencyIndex: Send + Sync {
    /// Atomically binds `key` to `task_id` unless the key is already bound.
    ///
    /// # Errors
    ///
    /// - [`TaskError::InvalidInput`] if the key is empty or too long.
    /// - [`TaskError::TransientStorage`] on backend failures.
    async fn reserve(&self, key: &str, task_id: &str) -> Result<Reservation, TaskError>;

    /// Returns the task id bound to `key`, if any.
    ///
    /// # Errors
    ///
    /// - [`TaskError::InvalidInput`] if the key is empty or too long.
    /// - [`TaskError::TransientStorage`] on backend failures.
    async fn lookup(&self, key: &str) -> Result<Option<String>, TaskError>;
}

/// What gets stored under `idem:{key}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IdempotencyRecord {
    task_id: String,
    created_at: DateTime<Utc>,
}

/// Rejects keys the index will not store.
///
/// # Examples
///
/// ```
/// use async_tasks::idempotency::validate_key;
///
/// assert!(validate_key("order-42").is_ok());
/// assert!(validate_key("").is_err());
/// ```
pub fn validate_key(key: &str) -> Result<(), TaskError> {
    if key.is_empty() {
        return Err(TaskError::InvalidInput(
            "idempotency key must not be empty".to_string(),
        ));
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(TaskError::InvalidInput(format!(
            "idempotency key exceeds {MAX_IDEMPOTENCY_KEY_LEN} bytes"
        )));
    }
    Ok(())
}

/// Idempotency index stored in a [`StorageBackend`].
///
/// Shares the backend type with the task store; records live under their own
/// namespace so the two never collide.
#[derive(Debug)]
pub struct BackendIdempotencyIndex<B: StorageBackend> {
    backend: B,
}

impl<B: StorageBackend> BackendIdempotencyIndex<B> {
    /// Creates an index over the given backend.
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    fn map_storage_error(err: StorageError) -> TaskError {
        match err {
            StorageError::Backend { message, .. } => TaskError::TransientStorage { message },
            other => TaskError::Internal(format!("unexpected idempotency index error: {other}")),
        }
    }

    async fn read(&self, key: &str) -> Result<Option<IdempotencyRecord>, TaskError> {
        match self.backend.get(&make_key(IDEMPOTENCY_NAMESPACE, key)).await {
            Ok(versioned) => serde_json::from_slice(&versioned.data)
                .map(Some)
                .map_err(|e| {
                    TaskError::Internal(format!("failed to deserialize idempotency record: {e}"))
                }),
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(e) => Err(Self::map_storage_error(e)),
        }
    }
}

#[async_trait]
impl<B: StorageBackend + 'static> IdempotencyIndex for BackendIdempotencyIndex<B> {
    async fn reserve(&self, key: &str, task_id: &str) -> Result<Reservation, TaskError> {
        validate_key(key)?;

        let record = IdempotencyRecord {
            task_id: task_id.to_string(),
            created_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&record).map_err(|e| {
            TaskError::Internal(format!("failed to serialize idempotency record: {e}"))
        })?;

        match self
            .backend
            .put_if_absent(&make_key(IDEMPOTENCY_NAMESPACE, key), &bytes)
            .await
        {
            Ok(_) => {
                tracing::debug!(task_id = task_id, "idempotency key reserved");
                Ok(Reservation::Reserved)
            },
            Err(StorageError::AlreadyExists { .. }) => match self.read(key).await? {
                Some(existing) => Ok(Reservation::Existing(existing.task_id)),
                // Entries are never deleted, so a vanished winner is a broken backend.
                None => Err(TaskError::Internal(
                    "idempotency record disappeared after a conflicting insert".to_string(),
                )),
            },
            Err(e) => Err(Self::map_storage_error(e)),
        }
    }

    async fn lookup(&self, key: &str) -> Result<Option<String>, TaskError> {
        validate_key(key)?;
        Ok(self.read(key).await?.map(|record| record.task_id))
    }
}
