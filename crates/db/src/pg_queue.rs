//! `job_queue`-table backed implementation of [`queue::JobQueue`].

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use queue::{EnqueueOptions, Job, JobQueue, Priority, QueueError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::models::JobRow;
use crate::repository::jobs;
use crate::{DbError, DbPool};

/// A durable queue for one topic. Payloads are stored as JSON.
///
/// `dequeue` polls; several workers (and processes) may poll the same topic.
/// It is cancel safe: a claim that commits after the caller stopped waiting
/// is returned to `pending`.
pub struct PgJobQueue<T> {
    pool: DbPool,
    topic: String,
    poll_interval: Duration,
    _payload: PhantomData<fn() -> T>,
}

impl<T> PgJobQueue<T> {
    pub fn new(pool: DbPool, topic: impl Into<String>) -> Self {
        Self {
            pool,
            topic: topic.into(),
            poll_interval: Duration::from_millis(500),
            _payload: PhantomData,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

fn backend(e: DbError) -> QueueError {
    QueueError::Backend(e.to_string())
}

/// Run `claim` to completion on its own task and hand the result over. When
/// the caller is gone by then, a claimed job goes to `release` instead.
async fn claim_detached<J, C, F, R>(claim: C, release: F) -> Result<Option<J>, QueueError>
where
    J: Send + 'static,
    C: Future<Output = Result<Option<J>, DbError>> + Send + 'static,
    F: FnOnce(J) -> R + Send + 'static,
    R: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let claimed = claim.await;
        if let Err(Ok(Some(job))) = tx.send(claimed) {
            release(job).await;
        }
    });
    match rx.await {
        Ok(claimed) => claimed.map_err(backend),
        Err(_) => Err(QueueError::Backend("job claim task failed".into())),
    }
}

#[async_trait]
impl<T> JobQueue<T> for PgJobQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn enqueue(&self, payload: T, options: EnqueueOptions) -> Result<String, QueueError> {
        let id = options
            .job_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let payload = serde_json::to_value(&payload)?;

        let inserted = jobs::enqueue_job(&self.pool, &self.topic, &id, options.priority.rank(), payload)
            .await
            .map_err(backend)?;
        if !inserted {
            debug!(job_id = %id, topic = %self.topic, "job already queued, ignoring duplicate");
        }
        Ok(id)
    }

    async fn dequeue(&self) -> Result<Option<Job<T>>, QueueError> {
        loop {
            let pool = self.pool.clone();
            let topic = self.topic.clone();
            let release_pool = self.pool.clone();
            let claimed = claim_detached(
                async move { jobs::fetch_next_job(&pool, &topic).await },
                move |row: JobRow| async move {
                    warn!(job_id = %row.id, "consumer left during claim, returning job to the queue");
                    if let Err(e) = jobs::release_job(&release_pool, &row.id).await {
                        error!(job_id = %row.id, error = %e, "failed to return job to the queue");
                    }
                },
            )
            .await?;

            if let Some(row) = claimed {
                match serde_json::from_value::<T>(row.payload) {
                    Ok(payload) => {
                        return Ok(Some(Job {
                            id: row.id,
                            priority: Priority::from_rank(row.priority),
                            enqueued_at: row.created_at,
                            payload,
                        }))
                    }
                    Err(e) => {
                        warn!(job_id = %row.id, error = %e, "undecodable job payload, marking failed");
                        jobs::fail_job(&self.pool, &row.id, &e.to_string())
                            .await
                            .map_err(backend)?;
                        continue;
                    }
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn complete(&self, job_id: &str) -> Result<(), QueueError> {
        jobs::complete_job(&self.pool, job_id).await.map_err(backend)
    }

    async fn fail(&self, job_id: &str, error: &str) -> Result<(), QueueError> {
        jobs::fail_job(&self.pool, job_id, error).await.map_err(backend)
    }
}
