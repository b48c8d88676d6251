//! Storage key namespaces and default thresholds.

/// Namespace for task records: keys look like `task:{task_id}`.
pub const TASK_NAMESPACE: &str = "task";

/// Namespace for idempotency records: keys look like `idem:{idempotency_key}`.
pub const IDEMPOTENCY_NAMESPACE: &str = "idem";

/// Default key prefix for the Redis backends.
pub const DEFAULT_KEY_PREFIX: &str = "async-tasks";

/// Default Redis list used as the work queue.
pub const DEFAULT_QUEUE_NAME: &str = "async-tasks:queue";

/// Language attached to a text submission when the caller omits one.
pub const DEFAULT_LANGUAGE: &str = "en";

/// Maximum accepted idempotency key length in bytes.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;
