//! In-memory storage backend.
//!
//! [`InMemoryBackend`] provides a thread-safe [`StorageBackend`] implementation
//! using `DashMap<String, (Vec<u8>, u64)>` for concurrent key-value storage.
//! It is a dumb KV store with no domain logic.
//!
//! # Concurrency
//!
//! Every conditional write runs inside a single `DashMap` entry guard, so the
//! check and the write happen under the same shard lock. That makes
//! `put_if_absent`, `put_if_version` and `delete_if_version` atomic within a
//! process. Records are not shared across processes; use the Redis backend
//! for that.
//!
//! # Examples
//!
//! ```
//! use async_tasks::store::memory::InMemoryTaskStore;
//! use async_tasks::store::{InMemoryBackend, TaskStore};
//!
//! let store: InMemoryTaskStore = InMemoryTaskStore::new(InMemoryBackend::new());
//! assert!(store.backend().is_empty());
//! ```

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::store::backend::{StorageBackend, StorageError, VersionedRecord};
use crate::store::generic::GenericTaskStore;

/// Thread-safe in-memory storage backend using [`DashMap`].
///
/// Stores serialized records as `(Vec<u8>, u64)` tuples where the `u64` is a
/// monotonic version number starting at 1.
///
/// # Examples
///
/// ```
/// use async_tasks::store::memory::InMemoryBackend;
/// use async_tasks::store::generic::GenericTaskStore;
///
/// let store = GenericTaskStore::new(InMemoryBackend::new());
/// assert_eq!(store.backend().len(), 0);
/// ```
#[derive(Debug)]
pub struct InMemoryBackend {
    data: DashMap<String, (Vec<u8>, u64)>,
}

impl InMemoryBackend {
    /// Creates an empty in-memory backend.
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Returns the number of records stored.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the backend contains no records.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        let entry = self.data.get(key).ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })?;
        let (data, version) = entry.value();
        Ok(VersionedRecord {
            data: data.clone(),
            version: *version,
        })
    }

    async fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        match self.data.entry(key.to_string()) {
            Entry::Occupied(entry) => Err(StorageError::AlreadyExists {
                key: key.to_string(),
                version: entry.get().1,
            }),
            Entry::Vacant(entry) => {
                entry.insert((data.to_vec(), 1));
                Ok(1)
            },
        }
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let Some(mut entry) = self.data.get_mut(key) else {
            return Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: 0,
            });
        };
        let current_version = entry.value().1;
        if current_version != expected_version {
            return Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: current_version,
            });
        }
        let new_version = current_version + 1;
        *entry.value_mut() = (data.to_vec(), new_version);
        Ok(new_version)
    }

    async fn delete_if_version(
        &self,
        key: &str,
        expected_version: u64,
    ) -> Result<bool, StorageError> {
        match self.data.entry(key.to_string()) {
            Entry::Vacant(_) => Ok(false),
            Entry::Occupied(entry) => {
                let current_version = entry.get().1;
                if current_version != expected_version {
                    return Err(StorageError::VersionConflict {
                        key: key.to_string(),
                        expected: expected_version,
                        actual: current_version,
                    });
                }
                entry.remove();
                Ok(true)
            },
        }
    }

    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError> {
        let results: Vec<(String, VersionedRecord)> = self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| {
                let (data, version) = entry.value();
                (
                    entry.key().clone(),
                    VersionedRecord {
                        data: data.clone(),
                        version: *version,
                    },
                )
            })
            .collect();
        Ok(results)
    }
}

/// Task store over the in-memory backend.
pub type InMemoryTaskStore = GenericTaskStore<InMemoryBackend>;
