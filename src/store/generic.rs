//! Generic task store with all domain logic delegating to a [`StorageBackend`].
//!
//! [`GenericTaskStore`] implements every task operation (state machine
//! validation, the `from`-status precondition, timestamp rules, canonical JSON
//! serialization) on top of any [`StorageBackend`] implementation.
//!
//! Backends remain dumb key-value stores; all intelligence lives here.
//!
//! # CAS Semantics
//!
//! `create` uses [`StorageBackend::put_if_absent`]; every later mutation is
//! read -> check `from` -> [`StorageBackend::put_if_version`]. A version
//! mismatch means another writer moved the task between our read and our
//! write and surfaces as [`TaskError::Conflict`], exactly like a failed
//! `from` check: both mean "someone else handled it".

use chrono::Utc;
use serde_json::Value;

use crate::constants::TASK_NAMESPACE;
use crate::domain::{TaskRecord, TransitionFields};
use crate::error::TaskError;
use crate::store::backend::{make_key, make_prefix, StorageBackend, StorageError};
use crate::types::task::TaskStatus;

/// Generic task store that delegates all storage to a [`StorageBackend`].
///
/// # Type Parameters
///
/// * `B` - A [`StorageBackend`] implementation (in-memory, Redis, ...)
///
/// # Examples
///
/// ```
/// use async_tasks::store::{GenericTaskStore, InMemoryBackend};
///
/// let store = GenericTaskStore::new(InMemoryBackend::new());
/// assert!(store.backend().is_empty());
/// ```
#[derive(Debug)]
pub struct GenericTaskStore<B: StorageBackend> {
    backend: B,
}

impl<B: StorageBackend> GenericTaskStore<B> {
    /// Creates a new generic task store backed by the given backend.
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    // ---- Serialization helpers (private) ----

    fn task_key(task_id: &str) -> String {
        make_key(TASK_NAMESPACE, task_id)
    }

    fn serialize_record(record: &TaskRecord) -> Result<Vec<u8>, TaskError> {
        serde_json::to_vec(record)
            .map_err(|e| TaskError::Internal(format!("failed to serialize TaskRecord: {e}")))
    }

    fn deserialize_record(data: &[u8]) -> Result<TaskRecord, TaskError> {
        serde_json::from_slice(data)
            .map_err(|e| TaskError::Internal(format!("failed to deserialize TaskRecord: {e}")))
    }

    fn map_storage_error(err: StorageError, task_id: &str) -> TaskError {
        match err {
            StorageError::NotFound { .. } => TaskError::NotFound {
                task_id: task_id.to_string(),
            },
            StorageError::AlreadyExists { .. } => TaskError::Conflict {
                task_id: task_id.to_string(),
                reason: "task id already exists".to_string(),
            },
            StorageError::VersionConflict {
                expected, actual, ..
            } => TaskError::Conflict {
                task_id: task_id.to_string(),
                reason: format!(
                    "concurrent modification: expected version {expected}, found {actual}"
                ),
            },
            StorageError::Backend { message, .. } => TaskError::TransientStorage { message },
            StorageError::Encoding { key, message } => {
                TaskError::Internal(format!("undecodable value at {key}: {message}"))
            },
        }
    }

    async fn read(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        let versioned = self
            .backend
            .get(&Self::task_key(task_id))
            .await
            .map_err(|e| Self::map_storage_error(e, task_id))?;

        let mut record = Self::deserialize_record(&versioned.data)?;
        record.version = versioned.version;
        Ok(record)
    }

    // ---- Domain operations (public) ----

    /// Creates a new task in the `Pending` state.
    ///
    /// Fails with [`TaskError::Conflict`] if `task_id` is already taken.
    pub async fn create(
        &self,
        task_id: &str,
        payload: Value,
        idempotency_key: Option<&str>,
    ) -> Result<TaskRecord, TaskError> {
        if task_id.is_empty() {
            return Err(TaskError::InvalidInput("task id must not be empty".to_string()));
        }

        let mut record = TaskRecord::new(
            task_id.to_string(),
            payload,
            idempotency_key.map(str::to_string),
        );
        let bytes = Self::serialize_record(&record)?;
        let version = self
            .backend
            .put_if_absent(&Self::task_key(task_id), &bytes)
            .await
            .map_err(|e| Self::map_storage_error(e, task_id))?;
        record.version = version;

        tracing::info!(task_id = task_id, "task created");
        Ok(record)
    }

    /// Retrieves a task by id.
    pub async fn get(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        self.read(task_id).await
    }

    /// Transitions a task from `from` to `to` with CAS-based atomicity.
    ///
    /// The edge is validated before touching storage, then the stored status
    /// must equal `from`, then the write must land on the version we read.
    /// A write fenced with [`TransitionFields::for_claim`] also requires
    /// that no newer claim has been granted.
    pub async fn transition(
        &self,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        fields: TransitionFields,
    ) -> Result<TaskRecord, TaskError> {
        from.validate_transition(task_id, &to)?;

        let mut record = self.read(task_id).await?;
        if record.status != from {
            return Err(TaskError::Conflict {
                task_id: task_id.to_string(),
                reason: format!("expected status {from}, found {}", record.status),
            });
        }
        if let Some(claim) = fields.claim {
            if record.attempts != claim {
                return Err(TaskError::Conflict {
                    task_id: task_id.to_string(),
                    reason: format!("claim {claim} superseded by claim {}", record.attempts),
                });
            }
        }

        record.apply_transition(to, fields, Utc::now());

        let bytes = Self::serialize_record(&record)?;
        let new_version = self
            .backend
            .put_if_version(&Self::task_key(task_id), &bytes, record.version)
            .await
            .map_err(|e| Self::map_storage_error(e, task_id))?;
        record.version = new_version;

        tracing::debug!(
            task_id = task_id,
            from = %from,
            to = %to,
            version = new_version,
            "task transitioned"
        );
        Ok(record)
    }

    /// Deletes a `Pending` task at the version we observe.
    ///
    /// Only for records that were never made visible: a task whose
    /// idempotency reservation was lost to a concurrent submission.
    pub async fn discard(&self, task_id: &str) -> Result<bool, TaskError> {
        let record = match self.read(task_id).await {
            Ok(record) => record,
            Err(TaskError::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };

        if record.status != TaskStatus::Pending {
            return Err(TaskError::Conflict {
                task_id: task_id.to_string(),
                reason: format!("cannot discard a task in status {}", record.status),
            });
        }

        let deleted = self
            .backend
            .delete_if_version(&Self::task_key(task_id), record.version)
            .await
            .map_err(|e| Self::map_storage_error(e, task_id))?;

        if deleted {
            tracing::debug!(task_id = task_id, "discarded unreserved task");
        }
        Ok(deleted)
    }

    /// Lists tasks in the given status, oldest `queued_at` first.
    ///
    /// Records that fail to decode are skipped with a warning so one bad
    /// record cannot stall a sweep.
    pub async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, TaskError> {
        let entries = self
            .backend
            .list_by_prefix(&make_prefix(TASK_NAMESPACE))
            .await
            .map_err(|e| Self::map_storage_error(e, ""))?;

        let mut tasks: Vec<TaskRecord> = entries
            .into_iter()
            .filter_map(|(key, versioned)| match Self::deserialize_record(&versioned.data) {
                Ok(mut record) => {
                    record.version = versioned.version;
                    Some(record)
                },
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping undecodable task record");
                    None
                },
            })
            .filter(|record| record.status == status)
            .collect();

        tasks.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));
        Ok(tasks)
    }

    /// Returns a reference to the underlying storage backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::VersionedRecord;
    use crate::store::memory::InMemoryBackend;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    fn test_store() -> GenericTaskStore<InMemoryBackend> {
        GenericTaskStore::new(InMemoryBackend::new())
    }

    // ---- Create tests ----

    #[tokio::test]
    async fn create_returns_pending_task() {
        let store = test_store();
        let record = store.create("t-1", json!("hello"), None).await.unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.payload, json!("hello"));
        assert_eq!(record.version, 1);
        assert!(record.started_at.is_none());
    }

    #[tokio::test]
    async fn create_duplicate_id_conflicts() {
        let store = test_store();
        store.create("t-1", json!("first"), None).await.unwrap();
        let result = store.create("t-1", json!("second"), None).await;
        assert!(matches!(result, Err(TaskError::Conflict { .. })));
        let stored = store.get("t-1").await.unwrap();
        assert_eq!(stored.payload, json!("first"));
    }

    #[tokio::test]
    async fn create_rejects_empty_id() {
        let store = test_store();
        let result = store.create("", json!(null), None).await;
        assert!(matches!(result, Err(TaskError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn create_stores_idempotency_key() {
        let store = test_store();
        store.create("t-1", json!(1), Some("key-a")).await.unwrap();
        let stored = store.get("t-1").await.unwrap();
        assert_eq!(stored.idempotency_key.as_deref(), Some("key-a"));
    }

    // ---- Get tests ----

    #[tokio::test]
    async fn get_returns_not_found_for_missing_task() {
        let store = test_store();
        let result = store.get("nonexistent").await;
        assert!(matches!(result, Err(TaskError::NotFound { .. })));
    }

    // ---- Transition tests ----

    #[tokio::test]
    async fn transition_full_lifecycle() {
        let store = test_store();
        store.create("t-1", json!("hello"), None).await.unwrap();

        let claimed = store
            .transition(
                "t-1",
                TaskStatus::Pending,
                TaskStatus::Processing,
                TransitionFields::none(),
            )
            .await
            .unwrap();
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert!(claimed.started_at.is_some());
        assert_eq!(claimed.version, 2);

        let done = store
            .transition(
                "t-1",
                TaskStatus::Processing,
                TaskStatus::Completed,
                TransitionFields::completed(json!("HELLO")),
            )
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(json!("HELLO")));
        assert!(done.finished_at.unwrap() >= done.started_at.unwrap());
    }

    #[tokio::test]
    async fn transition_with_stale_from_conflicts() {
        let store = test_store();
        store.create("t-1", json!(1), None).await.unwrap();
        store
            .transition(
                "t-1",
                TaskStatus::Pending,
                TaskStatus::Processing,
                TransitionFields::none(),
            )
            .await
            .unwrap();

        let result = store
            .transition(
                "t-1",
                TaskStatus::Pending,
                TaskStatus::Processing,
                TransitionFields::none(),
            )
            .await;
        match result {
            Err(TaskError::Conflict { reason, .. }) => {
                assert!(reason.contains("found PROCESSING"), "reason: {reason}");
            },
            other => panic!("expected Conflict, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn transition_rejects_invalid_edge_before_reading() {
        let store = test_store();
        // No task exists: the edge check fires first.
        let result = store
            .transition(
                "missing",
                TaskStatus::Pending,
                TaskStatus::Completed,
                TransitionFields::none(),
            )
            .await;
        assert!(matches!(result, Err(TaskError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn terminal_task_is_immutable() {
        let store = test_store();
        store.create("t-1", json!(1), None).await.unwrap();
        store
            .transition("t-1", TaskStatus::Pending, TaskStatus::Processing, TransitionFields::none())
            .await
            .unwrap();
        let done = store
            .transition(
                "t-1",
                TaskStatus::Processing,
                TaskStatus::Failed,
                TransitionFields::failed("boom"),
            )
            .await
            .unwrap();

        for (from, to) in [
            (TaskStatus::Processing, TaskStatus::Completed),
            (TaskStatus::Failed, TaskStatus::Processing),
            (TaskStatus::Failed, TaskStatus::Pending),
        ] {
            let err = store
                .transition("t-1", from, to, TransitionFields::completed(json!("late")))
                .await
                .unwrap_err();
            assert!(err.is_conflict(), "{from} -> {to}: {err}");
        }

        let after = store.get("t-1").await.unwrap();
        assert_eq!(after, done);
    }

    #[tokio::test]
    async fn recovery_edge_is_allowed() {
        let store = test_store();
        store.create("t-1", json!(1), None).await.unwrap();
        store
            .transition("t-1", TaskStatus::Pending, TaskStatus::Processing, TransitionFields::none())
            .await
            .unwrap();
        let recovered = store
            .transition("t-1", TaskStatus::Processing, TaskStatus::Pending, TransitionFields::none())
            .await
            .unwrap();
        assert_eq!(recovered.status, TaskStatus::Pending);
        assert!(recovered.started_at.is_some());
        assert!(recovered.claimed_at.is_none());
    }

    #[tokio::test]
    async fn superseded_claim_cannot_finish_task() {
        let store = test_store();
        store.create("t-1", json!(1), None).await.unwrap();
        let first = store
            .transition("t-1", TaskStatus::Pending, TaskStatus::Processing, TransitionFields::none())
            .await
            .unwrap();
        store
            .transition("t-1", TaskStatus::Processing, TaskStatus::Pending, TransitionFields::none())
            .await
            .unwrap();
        let second = store
            .transition("t-1", TaskStatus::Pending, TaskStatus::Processing, TransitionFields::none())
            .await
            .unwrap();
        assert_eq!((first.attempts, second.attempts), (1, 2));

        // The task is PROCESSING again, so only the fence tells the claims apart.
        let err = store
            .transition(
                "t-1",
                TaskStatus::Processing,
                TaskStatus::Completed,
                TransitionFields::completed(json!("stale")).for_claim(first.attempts),
            )
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get("t-1").await.unwrap(), second);

        let done = store
            .transition(
                "t-1",
                TaskStatus::Processing,
                TaskStatus::Completed,
                TransitionFields::completed(json!("fresh")).for_claim(second.attempts),
            )
            .await
            .unwrap();
        assert_eq!(done.result, Some(json!("fresh")));
    }

    // ---- Discard tests ----

    #[tokio::test]
    async fn discard_deletes_pending_task() {
        let store = test_store();
        store.create("t-1", json!(1), Some("k")).await.unwrap();
        assert!(store.discard("t-1").await.unwrap());
        assert!(matches!(
            store.get("t-1").await,
            Err(TaskError::NotFound { .. })
        ));
        assert!(!store.discard("t-1").await.unwrap());
    }

    #[tokio::test]
    async fn discard_refuses_claimed_task() {
        let store = test_store();
        store.create("t-1", json!(1), None).await.unwrap();
        store
            .transition("t-1", TaskStatus::Pending, TaskStatus::Processing, TransitionFields::none())
            .await
            .unwrap();
        assert!(matches!(
            store.discard("t-1").await,
            Err(TaskError::Conflict { .. })
        ));
    }

    // ---- Listing tests ----

    #[tokio::test]
    async fn list_by_status_filters_and_orders() {
        let store = test_store();
        store.create("a", json!(1), None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store.create("b", json!(2), None).await.unwrap();
        store.create("c", json!(3), None).await.unwrap();
        store
            .transition("c", TaskStatus::Pending, TaskStatus::Processing, TransitionFields::none())
            .await
            .unwrap();

        let pending = store.list_by_status(TaskStatus::Pending).await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let processing = store.list_by_status(TaskStatus::Processing).await.unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].version, 2);
    }

    #[tokio::test]
    async fn list_by_status_skips_undecodable_records() {
        let store = test_store();
        store.create("good", json!(1), None).await.unwrap();
        store
            .backend()
            .put_if_absent("task:bad", br#"{"task_id":"bad","status":"RUNNING"}"#)
            .await
            .unwrap();
        let pending = store.list_by_status(TaskStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, "good");
    }

    #[tokio::test]
    async fn get_rejects_unknown_stored_status() {
        let store = test_store();
        store
            .backend()
            .put_if_absent("task:bad", br#"{"task_id":"bad","status":"RUNNING"}"#)
            .await
            .unwrap();
        assert!(matches!(
            store.get("bad").await,
            Err(TaskError::Internal(_))
        ));
    }

    // ---- Concurrency ----

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let store = Arc::new(test_store());
        store.create("t-1", json!(1), None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .transition(
                        "t-1",
                        TaskStatus::Pending,
                        TaskStatus::Processing,
                        TransitionFields::none(),
                    )
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(e.is_conflict(), "unexpected error: {e}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.get("t-1").await.unwrap().attempts, 1);
    }

    // ---- Error mapping ----

    /// Backend that fails every call with the same error, to check error
    /// mapping.
    struct FailingBackend(fn() -> StorageError);

    fn connection_refused() -> StorageError {
        StorageError::Backend {
            message: "connection refused".to_string(),
            source: None,
        }
    }

    fn garbled_bytes() -> StorageError {
        StorageError::Encoding {
            key: "tasks:task:t-1".to_string(),
            message: "invalid utf-8 sequence of 1 bytes from index 0".to_string(),
        }
    }

    #[async_trait]
    impl StorageBackend for FailingBackend {
        async fn get(&self, _key: &str) -> Result<VersionedRecord, StorageError> {
            Err((self.0)())
        }

        async fn put_if_absent(&self, _key: &str, _data: &[u8]) -> Result<u64, StorageError> {
            Err((self.0)())
        }

        async fn put_if_version(
            &self,
            _key: &str,
            _data: &[u8],
            _expected_version: u64,
        ) -> Result<u64, StorageError> {
            unreachable!("get always fails first")
        }

        async fn delete_if_version(
            &self,
            _key: &str,
            _expected_version: u64,
        ) -> Result<bool, StorageError> {
            unreachable!("get always fails first")
        }

        async fn list_by_prefix(
            &self,
            _prefix: &str,
        ) -> Result<Vec<(String, VersionedRecord)>, StorageError> {
            Err((self.0)())
        }
    }

    #[tokio::test]
    async fn backend_failures_are_transient() {
        let store = GenericTaskStore::new(FailingBackend(connection_refused));
        let err = store.create("t-1", json!(1), None).await.unwrap_err();
        assert!(err.is_retryable(), "got: {err}");
        let err = store.get("t-1").await.unwrap_err();
        assert!(err.is_retryable(), "got: {err}");
        let err = store.list_by_status(TaskStatus::Pending).await.unwrap_err();
        assert!(err.is_retryable(), "got: {err}");
    }

    #[tokio::test]
    async fn encoding_failures_are_not_retried() {
        let store = GenericTaskStore::new(FailingBackend(garbled_bytes));
        let err = store.create("t-1", json!(1), None).await.unwrap_err();
        assert!(matches!(err, TaskError::Internal(_)), "got: {err}");
        assert!(!err.is_retryable());
        let err = store.get("t-1").await.unwrap_err();
        assert!(!err.is_retryable(), "got: {err}");
    }
}
