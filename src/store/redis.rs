//! Redis storage backend for task and idempotency records.
//!
//! [`RedisBackend`] implements [`StorageBackend`] using Redis as the
//! underlying key-value store. Reads use `HGETALL`; every write is a Lua
//! script (`redis::Script`) so the version check and the write execute as one
//! atomic step inside Redis, no matter how many processes share the server.
//!
//! # Key Schema
//!
//! | Key Pattern | Type | Purpose |
//! |-------------|------|---------|
//! | `{prefix}:{namespace}:{id}` | Hash | Record storage |
//! | `{prefix}:idx:{namespace}` | Set | Ids present in a namespace |
//!
//! Each record is stored as a Redis hash with two fields:
//!
//! | Field | Type | Description |
//! |-------|------|-------------|
//! | `version` | String (u64) | Monotonic CAS version, starts at 1 |
//! | `data` | String (JSON) | Serialized record |
//!
//! # Usage
//!
//! ```rust,no_run
//! use async_tasks::store::redis::RedisBackend;
//! use async_tasks::store::generic::GenericTaskStore;
//!
//! # async fn example() {
//! let backend = RedisBackend::new("redis://127.0.0.1:6379").await.unwrap();
//! let store = GenericTaskStore::new(backend);
//! # }
//! ```

use std::collections::HashMap;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;

use crate::constants::DEFAULT_KEY_PREFIX;
use crate::store::backend::{make_key, parse_key, StorageBackend, StorageError, VersionedRecord};

// ---------------------------------------------------------------------------
// Lua script constants
// ---------------------------------------------------------------------------

/// Create-only put.
///
/// KEYS[1] = record hash key, KEYS[2] = namespace index set key.
/// ARGV[1] = data JSON, ARGV[2] = id (set member).
/// Returns: {status, version} where status 1=created, 0=exists.
const LUA_PUT_IF_ABSENT: &str = r#"
local current_version = redis.call('HGET', KEYS[1], 'version')
if current_version then
    return {0, tonumber(current_version)}
end

redis.call('HSET', KEYS[1], 'version', '1', 'data', ARGV[1])
redis.call('SADD', KEYS[2], ARGV[2])

return {1, 1}
"#;

/// Conditional put (CAS): check version, then update or reject.
///
/// KEYS[1] = record hash key, KEYS[2] = namespace index set key.
/// ARGV[1] = data, ARGV[2] = expected_version, ARGV[3] = id.
/// Returns: {status, value} where status 1=success, 0=mismatch, -1=missing.
const LUA_PUT_IF_VERSION: &str = r#"
local current_version = redis.call('HGET', KEYS[1], 'version')
if not current_version then
    return {-1, 0}
end

local expected = tonumber(ARGV[2])
local actual = tonumber(current_version)
if actual ~= expected then
    return {0, actual}
end

local new_version = actual + 1
redis.call('HSET', KEYS[1], 'version', tostring(new_version), 'data', ARGV[1])
redis.call('SADD', KEYS[2], ARGV[3])

return {1, new_version}
"#;

/// Conditional delete: remove hash and index entry if the version matches.
///
/// KEYS[1] = record hash key, KEYS[2] = namespace index set key.
/// ARGV[1] = expected_version, ARGV[2] = id.
/// Returns: {status, value} where status 1=deleted, 0=mismatch, -1=missing.
const LUA_DELETE_IF_VERSION: &str = r#"
local current_version = redis.call('HGET', KEYS[1], 'version')
if not current_version then
    return {-1, 0}
end

local actual = tonumber(current_version)
if actual ~= tonumber(ARGV[1]) then
    return {0, actual}
end

redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[2])

return {1, actual}
"#;

// ---------------------------------------------------------------------------
// RedisBackend struct
// ---------------------------------------------------------------------------

/// Redis storage backend.
///
/// This backend is a thin adapter and contains **no domain logic**.
///
/// # Connection Model
///
/// `RedisBackend` holds a [`MultiplexedConnection`] which is designed to be
/// cloned cheaply; all clones share the same underlying TCP connection.
/// Each method clones the connection for concurrent safety.
#[derive(Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Creates a backend by connecting to Redis at the given URL.
    ///
    /// The URL format is `redis://[:<password>@]<host>:<port>[/<db>]`.
    /// Fails fast if the connection cannot be established.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the Redis client cannot be created
    /// or the connection cannot be established.
    pub async fn new(url: &str) -> Result<Self, StorageError> {
        let client = ::redis::Client::open(url).map_err(|e| StorageError::Backend {
            message: format!("failed to create Redis client: {e}"),
            source: Some(Box::new(e)),
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StorageError::Backend {
                message: format!("failed to connect to Redis: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(Self::with_connection(conn))
    }

    /// Creates a backend with a pre-built multiplexed connection.
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    /// Sets a custom key prefix (builder pattern).
    ///
    /// Deployments sharing one Redis use distinct prefixes; tests use a
    /// random prefix per run.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn hash_key(&self, namespace: &str, id: &str) -> String {
        format!("{}:{}:{}", self.key_prefix, namespace, id)
    }

    fn index_key(&self, namespace: &str) -> String {
        format!("{}:idx:{}", self.key_prefix, namespace)
    }
}

/// Splits a composite `{namespace}:{id}` key.
fn split_key(key: &str) -> Result<(&str, &str), StorageError> {
    parse_key(key).ok_or_else(|| StorageError::Backend {
        message: format!("invalid key format (missing ':'): {key}"),
        source: None,
    })
}

/// Strips the trailing colon from a `{namespace}:` prefix.
fn split_prefix(prefix: &str) -> Result<&str, StorageError> {
    prefix
        .strip_suffix(':')
        .ok_or_else(|| StorageError::Backend {
            message: format!("invalid prefix format (missing trailing ':'): {prefix}"),
            source: None,
        })
}

/// Values are stored as Redis strings, so they must be UTF-8.
fn data_as_str<'a>(data: &'a [u8], key: &str) -> Result<&'a str, StorageError> {
    std::str::from_utf8(data).map_err(|e| StorageError::Encoding {
        key: key.to_string(),
        message: format!("data is not valid UTF-8: {e}"),
    })
}

/// Maps a Redis error to a [`StorageError::Backend`].
fn map_redis_error(err: ::redis::RedisError, key: &str) -> StorageError {
    StorageError::Backend {
        message: format!("Redis error for key {key}: {err}"),
        source: Some(Box::new(err)),
    }
}

fn versioned_from_fields(
    fields: &HashMap<String, String>,
    key: &str,
) -> Result<VersionedRecord, StorageError> {
    let version: u64 = fields
        .get("version")
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| StorageError::Encoding {
            key: key.to_string(),
            message: "missing or invalid version field".to_string(),
        })?;
    let data = fields.get("data").ok_or_else(|| StorageError::Encoding {
        key: key.to_string(),
        message: "missing data field".to_string(),
    })?;
    Ok(VersionedRecord {
        data: data.as_bytes().to_vec(),
        version,
    })
}

// ---------------------------------------------------------------------------
// StorageBackend implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl StorageBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        let (namespace, id) = split_key(key)?;
        let mut conn = self.conn.clone();

        let fields: HashMap<String, String> = conn
            .hgetall(self.hash_key(namespace, id))
            .await
            .map_err(|e| map_redis_error(e, key))?;

        if fields.is_empty() {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }
        versioned_from_fields(&fields, key)
    }

    async fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        let (namespace, id) = split_key(key)?;
        let data_str = data_as_str(data, key)?;

        let (status, version): (i64, i64) = Script::new(LUA_PUT_IF_ABSENT)
            .key(self.hash_key(namespace, id))
            .key(self.index_key(namespace))
            .arg(data_str)
            .arg(id)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;

        if status == 1 {
            Ok(version as u64)
        } else {
            Err(StorageError::AlreadyExists {
                key: key.to_string(),
                version: version as u64,
            })
        }
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let (namespace, id) = split_key(key)?;
        let data_str = data_as_str(data, key)?;

        let (status, value): (i64, i64) = Script::new(LUA_PUT_IF_VERSION)
            .key(self.hash_key(namespace, id))
            .key(self.index_key(namespace))
            .arg(data_str)
            .arg(expected_version)
            .arg(id)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;

        match status {
            1 => Ok(value as u64),
            _ => Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: value as u64,
            }),
        }
    }

    async fn delete_if_version(
        &self,
        key: &str,
        expected_version: u64,
    ) -> Result<bool, StorageError> {
        let (namespace, id) = split_key(key)?;

        let (status, value): (i64, i64) = Script::new(LUA_DELETE_IF_VERSION)
            .key(self.hash_key(namespace, id))
            .key(self.index_key(namespace))
            .arg(expected_version)
            .arg(id)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;

        match status {
            1 => Ok(true),
            -1 => Ok(false),
            _ => Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: value as u64,
            }),
        }
    }

    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError> {
        let namespace = split_prefix(prefix)?;
        let idx_key = self.index_key(namespace);

        let ids: Vec<String> = self
            .conn
            .clone()
            .smembers(&idx_key)
            .await
            .map_err(|e| map_redis_error(e, prefix))?;

        let mut results = Vec::with_capacity(ids.len());
        let mut orphaned_ids: Vec<String> = Vec::new();

        for id in &ids {
            let fields: HashMap<String, String> = self
                .conn
                .clone()
                .hgetall(self.hash_key(namespace, id))
                .await
                .map_err(|e| map_redis_error(e, prefix))?;

            if fields.is_empty() {
                orphaned_ids.push(id.clone());
                continue;
            }

            let key = make_key(namespace, id);
            let record = versioned_from_fields(&fields, &key)?;
            results.push((key, record));
        }

        if !orphaned_ids.is_empty() {
            // Best-effort cleanup of index entries whose hash is gone.
            let cleanup: Result<(), ::redis::RedisError> =
                self.conn.clone().srem(&idx_key, &orphaned_ids).await;
            if let Err(e) = cleanup {
                tracing::debug!(error = %e, "failed to prune stale index entries");
            }
        }

        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Integration tests -- Redis backend contract tests
// ---------------------------------------------------------------------------
