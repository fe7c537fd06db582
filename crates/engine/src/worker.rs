//! Long-running consumer of the execution queue.

use std::sync::Arc;

use queue::{EnqueueOptions, Job, JobQueue, QueueError};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::models::ExecutionJob;
use crate::orchestrator::{Orchestrator, RunOutcome};

/// Topic of the durable queue carrying [`ExecutionJob`]s.
pub const EXECUTION_TOPIC: &str = "workflow-execution";

/// Tuning knobs for the worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Executions run in parallel.
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

/// Enqueue `job` under its execution id. A job whose id is already queued is
/// not added twice.
pub async fn submit(
    queue: &dyn JobQueue<ExecutionJob>,
    job: ExecutionJob,
) -> Result<String, QueueError> {
    let options = EnqueueOptions::with_id(job.execution_id.to_string()).priority(job.priority);
    let execution_id = job.execution_id;
    let workflow_id = job.workflow_id;
    let triggered_by = job.triggered_by;
    let id = queue.enqueue(job, options).await?;
    info!(
        execution_id = %execution_id,
        workflow_id = %workflow_id,
        triggered_by = %triggered_by,
        "execution job queued"
    );
    Ok(id)
}

/// Pulls jobs and runs up to `concurrency` orchestrations at once.
pub struct ExecutionWorker {
    queue: Arc<dyn JobQueue<ExecutionJob>>,
    orchestrator: Orchestrator,
    config: WorkerConfig,
}

impl ExecutionWorker {
    pub fn new(
        queue: Arc<dyn JobQueue<ExecutionJob>>,
        orchestrator: Orchestrator,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            config,
        }
    }

    /// Consume until `shutdown` fires or the queue closes, then wait for the
    /// runs already in flight.
    pub async fn run(&self, shutdown: CancellationToken) {
        let concurrency = self.config.concurrency.max(1);
        let slots = Arc::new(Semaphore::new(concurrency));
        info!(concurrency, "execution worker started");

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // `dequeue` is cancel safe, so losing this race never drops a
            // claimed job.
            let job = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                job = self.queue.dequeue() => job,
            };

            let job = match job {
                Ok(Some(job)) => job,
                Ok(None) => {
                    info!("execution queue closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "failed to dequeue execution job");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            let queue = Arc::clone(&self.queue);
            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move {
                process(queue.as_ref(), &orchestrator, job).await;
                drop(permit);
            });
        }

        // Every permit back means every spawned run has finished.
        let total = u32::try_from(concurrency).unwrap_or(u32::MAX);
        let _ = slots.acquire_many(total).await;
        info!("execution worker stopped");
    }
}

async fn process(queue: &dyn JobQueue<ExecutionJob>, orchestrator: &Orchestrator, job: Job<ExecutionJob>) {
    let ack = match orchestrator.run(&job.payload).await {
        Ok(RunOutcome::Completed { .. }) => queue.complete(&job.id).await,
        Ok(RunOutcome::Failed { error, .. }) => queue.fail(&job.id, &error).await,
        Ok(RunOutcome::Skipped) => queue.fail(&job.id, "workflow graph contains a cycle").await,
        Err(e) => {
            error!(execution_id = %job.payload.execution_id, error = %e, "execution aborted");
            queue.fail(&job.id, &e.to_string()).await
        }
    };
    if let Err(e) = ack {
        warn!(job_id = %job.id, error = %e, "failed to acknowledge execution job");
    }
}
