//! Redis list work queue.
//!
//! Producers `LPUSH` JSON-encoded [`QueueEntry`] values and consumers `RPOP`
//! them, so each entry reaches exactly one consumer. Consumers poll with a
//! short sleep instead of issuing `BRPOP`: a blocking pop would stall every
//! other command sharing the multiplexed connection.
//!
//! ```rust,no_run
//! use async_tasks::queue::redis::RedisWorkQueue;
//!
//! # async fn example() {
//! let queue = RedisWorkQueue::new("redis://127.0.0.1:6379")
//!     .await
//!     .unwrap()
//!     .with_queue_name("my-app:queue");
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::AsyncCommands;
use async_trait::async_trait;

use super::{QueueEntry, QueueError, WorkQueue};
use crate::constants::DEFAULT_QUEUE_NAME;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Work queue on a Redis list.
#[derive(Clone)]
pub struct RedisWorkQueue {
    conn: MultiplexedConnection,
    queue_name: String,
    poll_interval: Duration,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for RedisWorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWorkQueue")
            .field("queue_name", &self.queue_name)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

fn map_redis_error(err: ::redis::RedisError) -> QueueError {
    QueueError::Backend {
        message: format!("Redis queue error: {err}"),
        source: Some(Box::new(err)),
    }
}

impl RedisWorkQueue {
    /// Connects to Redis at the given URL.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] if the client cannot be created or the
    /// connection cannot be established.
    pub async fn new(url: &str) -> Result<Self, QueueError> {
        let client = ::redis::Client::open(url).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        Ok(Self::with_connection(conn))
    }

    /// Wraps a pre-built multiplexed connection.
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets the Redis list name (builder pattern).
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Sets how long an idle consumer sleeps between pops.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn pop(&self) -> Result<Option<QueueEntry>, QueueError> {
        let raw: Option<String> = self
            .conn
            .clone()
            .rpop(&self.queue_name, None)
            .await
            .map_err(map_redis_error)?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn enqueue(&self, entry: QueueEntry) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let raw = serde_json::to_string(&entry)?;
        let _: i64 = self
            .conn
            .clone()
            .lpush(&self.queue_name, raw)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<QueueEntry>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(entry) = self.pop().await? {
                return Ok(Some(entry));
            }
            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn len(&self) -> Result<usize, QueueError> {
        self.conn
            .clone()
            .llen(&self.queue_name)
            .await
            .map_err(map_redis_error)
    }
}

#[cfg(all(test, feature = "redis-tests"))]
mod integration_tests {
    use super::*;

    async fn test_queue() -> RedisWorkQueue {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisWorkQueue::new(&url)
            .await
            .expect("Redis connection failed -- is Redis running?")
            .with_queue_name(format!("test-{}:queue", uuid::Uuid::new_v4()))
            .with_poll_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn redis_queue_is_fifo() {
        let queue = test_queue().await;
        queue.enqueue(QueueEntry::new("a")).await.unwrap();
        queue.enqueue(QueueEntry::new("b")).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);

        let first = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let second = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.task_id, "a");
        assert_eq!(second.task_id, "b");
    }

    #[tokio::test]
    async fn redis_queue_times_out_when_empty() {
        let queue = test_queue().await;
        let got = queue.dequeue(Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }
}
