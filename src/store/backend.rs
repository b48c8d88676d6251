//! Low-level key-value storage backend trait and supporting types.
//!
//! The [`StorageBackend`] trait defines the contract that all storage engines
//! implement: [`get`](StorageBackend::get),
//! [`put_if_absent`](StorageBackend::put_if_absent),
//! [`put_if_version`](StorageBackend::put_if_version),
//! [`delete_if_version`](StorageBackend::delete_if_version) and
//! [`list_by_prefix`](StorageBackend::list_by_prefix).
//!
//! Domain logic (state machine validation, idempotency, serialization) does
//! **not** belong here. Backends are dumb KV stores; domain logic lives in
//! [`GenericTaskStore`](crate::store::generic::GenericTaskStore) and
//! [`BackendIdempotencyIndex`](crate::idempotency::BackendIdempotencyIndex).
//!
//! # Key Structure
//!
//! Keys are composite strings in the format `{namespace}:{id}`, for example
//! `task:6f1c...` or `idem:client-key-42`. Namespaces never contain a colon;
//! ids may, so parsing splits on the first colon only.
//!
//! # Versioning
//!
//! Each stored record carries a monotonic `u64` version number starting at
//! 1, incremented on every successful write. Every write is conditional:
//! either "only if absent" or "only if still at this version". There is no
//! unconditional overwrite.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

/// A stored record paired with its monotonic version number.
///
/// # Examples
///
/// ```
/// use async_tasks::store::backend::VersionedRecord;
///
/// let record = VersionedRecord {
///     data: b"{}".to_vec(),
///     version: 1,
/// };
/// assert_eq!(record.version, 1);
/// ```
#[derive(Debug, Clone)]
pub struct VersionedRecord {
    /// The serialized record bytes (JSON).
    pub data: Vec<u8>,

    /// Monotonic version number. Starts at 1, increments on each
    /// successful write.
    pub version: u64,
}

/// Errors that can occur during raw storage operations.
///
/// The domain layer maps these to [`TaskError`](crate::error::TaskError)
/// variants before surfacing them to callers.
///
/// # Examples
///
/// ```
/// use async_tasks::store::backend::StorageError;
///
/// let err = StorageError::NotFound { key: "task:123".to_string() };
/// assert!(err.to_string().contains("task:123"));
///
/// let err = StorageError::VersionConflict {
///     key: "k".to_string(),
///     expected: 2,
///     actual: 3,
/// };
/// assert!(err.to_string().contains("expected 2"));
/// ```
#[derive(Debug)]
pub enum StorageError {
    /// The requested key was not found in storage.
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// A [`put_if_absent`](StorageBackend::put_if_absent) call found the
    /// key already present.
    AlreadyExists {
        /// The key that already exists.
        key: String,
        /// Version of the existing record.
        version: u64,
    },

    /// A conditional write found a different version than expected.
    VersionConflict {
        /// The key where the conflict occurred.
        key: String,
        /// The version the caller expected.
        expected: u64,
        /// The actual version found in storage (0 if the key vanished).
        actual: u64,
    },

    /// An I/O or backend-specific error occurred (network failure,
    /// timeout, connection reset).
    Backend {
        /// Human-readable description of the error.
        message: String,
        /// The underlying error, if available. Accessible via
        /// [`std::error::Error::source()`].
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A stored or submitted value could not be encoded or decoded. Never
    /// transient: the same bytes fail the same way on every attempt.
    Encoding {
        /// The key whose value was rejected.
        key: String,
        /// Human-readable description of the error.
        message: String,
    },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { key } => write!(f, "key not found: {key}"),
            Self::AlreadyExists { key, version } => {
                write!(f, "key already exists: {key} (version {version})")
            },
            Self::VersionConflict {
                key,
                expected,
                actual,
            } => write!(
                f,
                "version conflict on key {key}: expected {expected}, found {actual}"
            ),
            Self::Backend { message, .. } => write!(f, "backend error: {message}"),
            Self::Encoding { key, message } => write!(f, "encoding error on key {key}: {message}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend {
                source: Some(src), ..
            } => Some(src.as_ref()),
            _ => None,
        }
    }
}

/// Key-value storage backend for task and idempotency records.
///
/// # Atomicity
///
/// [`put_if_absent`](StorageBackend::put_if_absent),
/// [`put_if_version`](StorageBackend::put_if_version) and
/// [`delete_if_version`](StorageBackend::delete_if_version) must each be a
/// single atomic operation *in the storage engine*, not guarded by an
/// in-process lock: independent processes share one backend and correctness
/// rests entirely on these primitives.
///
/// # Durability
///
/// A write returns only after the engine has acknowledged it.
///
/// # No Domain Logic
///
/// Backends must **never** interpret the bytes they store.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a record by key.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if no record exists for the given key.
    /// - [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError>;

    /// Stores a record only if the key does not exist yet. The new record
    /// gets version 1.
    ///
    /// # Errors
    ///
    /// - [`StorageError::AlreadyExists`] if the key is present.
    /// - [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<u64, StorageError>;

    /// Stores a record only if the current version matches `expected_version`.
    ///
    /// This is the compare-and-swap (CAS) primitive. On success the version
    /// is incremented and returned.
    ///
    /// # Errors
    ///
    /// - [`StorageError::VersionConflict`] if the stored version does not
    ///   match, or the key no longer exists (`actual == 0`).
    /// - [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError>;

    /// Deletes a record only if it is still at `expected_version`.
    ///
    /// Returns `true` if the record was deleted, `false` if the key did not
    /// exist.
    ///
    /// # Errors
    ///
    /// - [`StorageError::VersionConflict`] if the record changed.
    /// - [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn delete_if_version(&self, key: &str, expected_version: u64)
        -> Result<bool, StorageError>;

    /// Lists all records whose key starts with the given prefix.
    ///
    /// Used with `{namespace}:` prefixes by the sweeps.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Backend`] on I/O or backend-specific failures.
    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError>;
}

#[async_trait]
impl<T: StorageBackend + ?Sized> StorageBackend for Arc<T> {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        (**self).get(key).await
    }

    async fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        (**self).put_if_absent(key, data).await
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        (**self).put_if_version(key, data, expected_version).await
    }

    async fn delete_if_version(
        &self,
        key: &str,
        expected_version: u64,
    ) -> Result<bool, StorageError> {
        (**self).delete_if_version(key, expected_version).await
    }

    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError> {
        (**self).list_by_prefix(prefix).await
    }
}

/// Constructs a storage key from a namespace and an id.
///
/// # Examples
///
/// ```
/// use async_tasks::store::backend::make_key;
///
/// assert_eq!(make_key("task", "123"), "task:123");
/// assert_eq!(make_key("idem", "a:b"), "idem:a:b");
/// ```
pub fn make_key(namespace: &str, id: &str) -> String {
    format!("{namespace}:{id}")
}

/// Parses a storage key into `(namespace, id)`, splitting on the first colon.
///
/// # Examples
///
/// ```
/// use async_tasks::store::backend::parse_key;
///
/// assert_eq!(parse_key("task:123"), Some(("task", "123")));
/// assert_eq!(parse_key("idem:a:b"), Some(("idem", "a:b")));
/// assert_eq!(parse_key("no-colon"), None);
/// ```
pub fn parse_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(':')
}

/// Constructs a prefix for listing every record in a namespace.
///
/// # Examples
///
/// ```
/// use async_tasks::store::backend::make_prefix;
///
/// assert_eq!(make_prefix("task"), "task:");
/// ```
pub fn make_prefix(namespace: &str) -> String {
    format!("{namespace}:")
}
