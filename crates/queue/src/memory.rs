//! In-process priority queue backed by a binary heap.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{EnqueueOptions, Job, JobQueue, QueueError};

struct Entry<T> {
    seq: u64,
    job: Job<T>,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // Max-heap: higher priority first, then lower sequence number (FIFO).
    fn cmp(&self, other: &Self) -> Ordering {
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State<T> {
    heap: BinaryHeap<Entry<T>>,
    waiting_ids: HashSet<String>,
    next_seq: u64,
    closed: bool,
}

/// A [`JobQueue`] living entirely in memory.
///
/// Used by tests, by the single-process `run` command, and for the AI task
/// queue whose producers and consumers share a process.
pub struct MemoryQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

impl<T> Default for MemoryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MemoryQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                waiting_ids: HashSet::new(),
                next_seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Number of jobs waiting to be dequeued.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting jobs. Consumers drain what is left, then see `None`.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl<T> JobQueue<T> for MemoryQueue<T>
where
    T: Send + 'static,
{
    async fn enqueue(&self, payload: T, options: EnqueueOptions) -> Result<String, QueueError> {
        let id = options
            .job_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(QueueError::Closed);
            }
            if !state.waiting_ids.insert(id.clone()) {
                tracing::debug!(job_id = %id, "job already queued, ignoring duplicate");
                return Ok(id);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Entry {
                seq,
                job: Job {
                    id: id.clone(),
                    priority: options.priority,
                    enqueued_at: Utc::now(),
                    payload,
                },
            });
        }

        self.notify.notify_one();
        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<Job<T>>, QueueError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().unwrap();
                if let Some(entry) = state.heap.pop() {
                    state.waiting_ids.remove(&entry.job.id);
                    return Ok(Some(entry.job));
                }
                if state.closed {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Priority;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_come_out_fifo_within_a_priority() {
        let queue = MemoryQueue::new();
        for n in 0..3 {
            queue.enqueue(n, EnqueueOptions::default()).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(queue.dequeue().await.unwrap().unwrap().payload);
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn higher_priority_jumps_the_line() {
        let queue = MemoryQueue::new();
        queue.enqueue("low", EnqueueOptions::default().priority(Priority::Low)).await.unwrap();
        queue.enqueue("normal", EnqueueOptions::default()).await.unwrap();
        queue.enqueue("high", EnqueueOptions::default().priority(Priority::High)).await.unwrap();

        assert_eq!(queue.dequeue().await.unwrap().unwrap().payload, "high");
        assert_eq!(queue.dequeue().await.unwrap().unwrap().payload, "normal");
        assert_eq!(queue.dequeue().await.unwrap().unwrap().payload, "low");
    }

    #[tokio::test]
    async fn duplicate_job_id_is_ignored_while_waiting() {
        let queue = MemoryQueue::new();
        queue.enqueue(1, EnqueueOptions::with_id("exec-1")).await.unwrap();
        queue.enqueue(2, EnqueueOptions::with_id("exec-1")).await.unwrap();

        assert_eq!(queue.len(), 1);
        let job = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(job.id, "exec-1");
        assert_eq!(job.payload, 1);
    }

    #[tokio::test]
    async fn dequeue_waits_for_a_producer() {
        let queue = Arc::new(MemoryQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue("late", EnqueueOptions::default()).await.unwrap();

        let job = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(job.payload, "late");
    }

    #[tokio::test]
    async fn close_wakes_idle_consumers() {
        let queue: Arc<MemoryQueue<u8>> = Arc::new(MemoryQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        assert!(consumer.await.unwrap().unwrap().is_none());
        assert!(matches!(
            queue.enqueue(1, EnqueueOptions::default()).await,
            Err(QueueError::Closed)
        ));
    }
}
