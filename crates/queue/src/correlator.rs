//! Request/response over a work queue.
//!
//! A producer places a task on the queue under a task id and waits, with a
//! deadline, for a consumer to publish the result under the same id. The
//! consumer side is any number of workers calling [`Correlator::next_task`]
//! and [`Correlator::complete`]. The queue must be private to one correlator:
//! a task nobody here waits on is treated as abandoned.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{EnqueueOptions, Job, JobQueue, QueueError};

pub struct Correlator<Req, Resp> {
    queue: Arc<dyn JobQueue<Req>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Resp>>>,
}

impl<Req, Resp> Correlator<Req, Resp>
where
    Req: Send + 'static,
{
    pub fn new(queue: Arc<dyn JobQueue<Req>>) -> Self {
        Self {
            queue,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue `payload` as `task_id` and wait up to `timeout` for its result.
    ///
    /// # Errors
    /// - [`QueueError::Timeout`] when no result arrives in time.
    /// - [`QueueError::Abandoned`] when the correlator forgets the task.
    /// - Any error from the underlying queue's `enqueue`.
    pub async fn request(
        &self,
        task_id: &str,
        payload: Req,
        timeout: Duration,
    ) -> Result<Resp, QueueError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(task_id.to_owned(), tx);

        if let Err(e) = self
            .queue
            .enqueue(payload, EnqueueOptions::with_id(task_id))
            .await
        {
            self.forget(task_id);
            return Err(e);
        }
        debug!(task_id, "task enqueued, waiting for result");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(QueueError::Abandoned(task_id.to_owned())),
            Err(_) => {
                self.forget(task_id);
                Err(QueueError::Timeout {
                    task_id: task_id.to_owned(),
                    after: timeout,
                })
            }
        }
    }

    /// Consumer side: wait for the next task whose producer is still
    /// waiting. Tasks left behind by a timed-out producer are dropped here.
    pub async fn next_task(&self) -> Result<Option<Job<Req>>, QueueError> {
        loop {
            let Some(job) = self.queue.dequeue().await? else {
                return Ok(None);
            };
            if self.pending.lock().unwrap().contains_key(&job.id) {
                return Ok(Some(job));
            }
            debug!(task_id = %job.id, "skipping task abandoned by its producer");
        }
    }

    /// Consumer side: publish the result for `task_id`.
    ///
    /// Returns `false` when nobody is waiting any more (the producer timed out).
    pub fn complete(&self, task_id: &str, resp: Resp) -> bool {
        let waiter = self.pending.lock().unwrap().remove(task_id);
        match waiter {
            Some(tx) => tx.send(resp).is_ok(),
            None => {
                warn!(task_id, "result arrived for a task nobody is waiting on");
                false
            }
        }
    }

    /// Number of producers currently waiting.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn forget(&self, task_id: &str) {
        self.pending.lock().unwrap().remove(task_id);
    }
}
