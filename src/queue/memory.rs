//! In-process work queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{QueueEntry, QueueError, WorkQueue};

/// FIFO queue shared by the tasks of one process.
///
/// Consumers park on a [`Notify`] instead of polling. The `notified()`
/// future is armed before the queue is checked, so an entry pushed between
/// the check and the wait still wakes the consumer.
#[derive(Debug, Default)]
pub struct InMemoryWorkQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
    notify: Notify,
    closed: AtomicBool,
}

impl InMemoryWorkQueue {
    /// Creates an empty, open queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn pop(&self) -> Option<QueueEntry> {
        self.entries.lock().pop_front()
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, entry: QueueEntry) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        self.entries.lock().push_back(entry);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<QueueEntry>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.pop() {
                return Ok(Some(entry));
            }
            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // One last look: an entry may have landed as the timer fired.
                return Ok(self.pop());
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.entries.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn fifo_order() {
        let queue = InMemoryWorkQueue::new();
        queue.enqueue(QueueEntry::new("a")).await.unwrap();
        queue.enqueue(QueueEntry::new("b")).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);

        let first = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let second = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.task_id, "a");
        assert_eq!(second.task_id, "b");
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn dequeue_times_out_when_empty() {
        let queue = InMemoryWorkQueue::new();
        let got = queue.dequeue(Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn waiting_consumer_is_woken_by_enqueue() {
        let queue = Arc::new(InMemoryWorkQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(QueueEntry::new("late")).await.unwrap();

        let got = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(got.task_id, "late");
    }

    #[tokio::test]
    async fn close_wakes_consumers_and_rejects_enqueue() {
        let queue = Arc::new(InMemoryWorkQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close().await;

        assert!(consumer.await.unwrap().unwrap().is_none());
        assert!(queue.is_closed());
        assert!(matches!(
            queue.enqueue(QueueEntry::new("x")).await,
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn each_entry_goes_to_one_consumer() {
        let queue = Arc::new(InMemoryWorkQueue::new());
        for i in 0..50 {
            queue.enqueue(QueueEntry::new(format!("t-{i}"))).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(entry) = queue.dequeue(Duration::from_millis(10)).await.unwrap() {
                    seen.push(entry.task_id);
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        assert_eq!(all.len(), 50);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 50);
    }
}
