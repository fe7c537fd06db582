//! Execution orchestrator.
//!
//! [`Orchestrator::run`] drives one [`ExecutionJob`] end to end:
//! 1. Builds the graph; a node that fails validation fails the run before
//!    anything executes.
//! 2. Skips cyclic graphs without persisting anything.
//! 3. Loads the owning user's credentials once.
//! 4. Walks nodes in topological order, one at a time. Trigger nodes get an
//!    output synthesized from the job; action nodes go through the
//!    [`ActionDispatcher`] with every output produced so far.
//! 5. Stops at the first failing node and marks the run `FAILED`, or marks
//!    it `COMPLETED` with its duration and node results.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use db::models::{ExecutionRecord, ExecutionStatus, ExecutionUpdate, NodeResult, NodeStatus};
use db::{CredentialStore, ExecutionStore};
use nodes::{ActionDispatcher, ActionServices, Credential, CredentialMap, ExecutionScope};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::events::{EventPublisher, EventStatus, LifecycleEvent, WORKFLOW_NODE_ID};
use crate::graph::Graph;
use crate::models::ExecutionJob;
use crate::node::NodeKind;
use crate::EngineError;

/// Key under which an action sees its single direct predecessor's output.
pub const PREVIOUS_NODE_KEY: &str = "previousNode";

// ---------------------------------------------------------------------------
// Output of a run
// ---------------------------------------------------------------------------

/// How a run ended. Infrastructure failures come back as [`EngineError`]
/// instead.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        node_results: Vec<NodeResult>,
        duration_ms: i64,
    },
    /// `node_id` is `None` when the run failed before reaching a node
    /// (e.g. credentials could not be loaded).
    Failed {
        node_id: Option<String>,
        error: String,
    },
    /// The graph has a cycle; nothing ran and nothing was persisted.
    Skipped,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Shared, stateless entry point. Every call to [`Orchestrator::run`] builds
/// its own graph, dispatcher, credential map and output map.
#[derive(Clone)]
pub struct Orchestrator {
    credentials: Arc<dyn CredentialStore>,
    executions: Arc<dyn ExecutionStore>,
    services: Arc<ActionServices>,
    events: EventPublisher,
}

impl Orchestrator {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        executions: Arc<dyn ExecutionStore>,
        services: Arc<ActionServices>,
        events: EventPublisher,
    ) -> Self {
        Self {
            credentials,
            executions,
            services,
            events,
        }
    }

    /// Run one job to completion.
    ///
    /// # Errors
    /// Only for persistence failures; node failures are a [`RunOutcome`].
    #[instrument(
        skip(self, job),
        fields(
            execution_id = %job.execution_id,
            workflow_id = %job.workflow_id,
            triggered_by = %job.triggered_by
        )
    )]
    pub async fn run(&self, job: &ExecutionJob) -> Result<RunOutcome, EngineError> {
        let clock = Instant::now();
        let started_at = Utc::now();

        // ------------------------------------------------------------------
        // Build and check the graph.
        // ------------------------------------------------------------------
        let graph = match Graph::build(&job.workflow) {
            Ok(graph) => graph,
            Err(e) => {
                let node_id = e.node_id().map(str::to_owned);
                error!(node_id = ?node_id, error = %e, "workflow failed validation");
                return self
                    .fail_before_start(job, started_at, clock, node_id, e.to_string())
                    .await;
            }
        };

        if graph.detect_cycle() {
            warn!("workflow graph contains a cycle, not executing");
            return Ok(RunOutcome::Skipped);
        }

        self.executions
            .create(&new_record(job, ExecutionStatus::Running, started_at))
            .await?;
        self.events
            .publish(LifecycleEvent::for_job(job, WORKFLOW_NODE_ID, EventStatus::Started))
            .await;

        // ------------------------------------------------------------------
        // Per-execution state.
        // ------------------------------------------------------------------
        let credentials = match self.load_credentials(job).await {
            Ok(credentials) => credentials,
            Err(e) => {
                let message = format!("failed to load credentials: {e}");
                error!(error = %e, "failed to load credentials");
                return self.finish_failed(job, clock, Vec::new(), None, message).await;
            }
        };

        let order = graph.order();
        info!(nodes = order.len(), order = ?order, "executing workflow");

        let mut run = ExecutionRun {
            job,
            dispatcher: ActionDispatcher::new(
                Arc::clone(&self.services),
                Arc::new(credentials),
                ExecutionScope {
                    execution_id: job.execution_id,
                    user_id: job.user_id,
                },
            ),
            graph,
            outputs: Map::new(),
            results: Vec::with_capacity(order.len()),
        };

        // ------------------------------------------------------------------
        // Execute nodes sequentially; the first failure ends the walk.
        // ------------------------------------------------------------------
        for node_id in &order {
            self.events
                .publish(LifecycleEvent::for_job(job, node_id, EventStatus::Started))
                .await;

            match run.step(node_id).await {
                Ok(output) => {
                    info!(node_id = %node_id, "node completed");
                    self.events
                        .publish(
                            LifecycleEvent::for_job(job, node_id, EventStatus::Completed)
                                .with_data(output),
                        )
                        .await;
                }
                Err(message) => {
                    error!(node_id = %node_id, error = %message, "node failed, aborting execution");
                    self.events
                        .publish(
                            LifecycleEvent::for_job(job, node_id, EventStatus::Failed)
                                .with_data(json!({ "message": message })),
                        )
                        .await;
                    return self
                        .finish_failed(job, clock, run.results, Some(node_id.clone()), message)
                        .await;
                }
            }
        }

        // ------------------------------------------------------------------
        // Mark execution as completed.
        // ------------------------------------------------------------------
        let duration_ms = elapsed_ms(clock);
        self.executions
            .update(
                job.execution_id,
                &ExecutionUpdate {
                    status: Some(ExecutionStatus::Completed),
                    completed_at: Some(Utc::now()),
                    duration_ms: Some(duration_ms),
                    node_results: Some(run.results.clone()),
                    ..Default::default()
                },
            )
            .await?;
        self.events
            .publish(
                LifecycleEvent::for_job(job, WORKFLOW_NODE_ID, EventStatus::Completed)
                    .with_data(json!({ "durationMs": duration_ms })),
            )
            .await;
        info!(duration_ms, "workflow execution completed");

        Ok(RunOutcome::Completed {
            node_results: run.results,
            duration_ms,
        })
    }

    async fn load_credentials(&self, job: &ExecutionJob) -> Result<CredentialMap, EngineError> {
        let rows = self.credentials.find_by_user(job.user_id).await?;
        let map: CredentialMap = rows
            .into_iter()
            .map(|row| Credential::new(row.application, row.data))
            .collect();
        debug!(count = map.len(), "credentials loaded");
        Ok(map)
    }

    /// Validation failed: persist a `FAILED` record without running anything.
    async fn fail_before_start(
        &self,
        job: &ExecutionJob,
        started_at: DateTime<Utc>,
        clock: Instant,
        node_id: Option<String>,
        error: String,
    ) -> Result<RunOutcome, EngineError> {
        let mut record = new_record(job, ExecutionStatus::Failed, started_at);
        record.completed_at = Some(Utc::now());
        record.duration_ms = Some(elapsed_ms(clock));
        record.error = Some(error.clone());
        record.failed_node_id = node_id.clone();
        self.executions.create(&record).await?;

        self.events
            .publish(
                LifecycleEvent::for_job(job, WORKFLOW_NODE_ID, EventStatus::Failed)
                    .with_data(json!({ "message": error })),
            )
            .await;
        Ok(RunOutcome::Failed { node_id, error })
    }

    async fn finish_failed(
        &self,
        job: &ExecutionJob,
        clock: Instant,
        node_results: Vec<NodeResult>,
        node_id: Option<String>,
        error: String,
    ) -> Result<RunOutcome, EngineError> {
        self.executions
            .update(
                job.execution_id,
                &ExecutionUpdate {
                    status: Some(ExecutionStatus::Failed),
                    completed_at: Some(Utc::now()),
                    duration_ms: Some(elapsed_ms(clock)),
                    node_results: Some(node_results),
                    error: Some(error.clone()),
                    failed_node_id: node_id.clone(),
                },
            )
            .await?;
        self.events
            .publish(
                LifecycleEvent::for_job(job, WORKFLOW_NODE_ID, EventStatus::Failed)
                    .with_data(json!({ "message": error, "nodeId": node_id })),
            )
            .await;
        Ok(RunOutcome::Failed { node_id, error })
    }
}

// ---------------------------------------------------------------------------
// Per-execution state
// ---------------------------------------------------------------------------

/// Everything one run owns. Dropped when the run ends.
struct ExecutionRun<'a> {
    job: &'a ExecutionJob,
    graph: Graph,
    dispatcher: ActionDispatcher,
    outputs: Map<String, Value>,
    results: Vec<NodeResult>,
}

impl ExecutionRun<'_> {
    /// Execute one node and record its output. On failure the error-shaped
    /// output is recorded and the message returned.
    async fn step(&mut self, node_id: &str) -> Result<Value, String> {
        let Some(node) = self.graph.node(node_id) else {
            return Err(format!("node '{node_id}' not found"));
        };

        let result = match &node.kind {
            NodeKind::Action(action) => {
                let prior = prior_outputs(&self.graph, &self.outputs, node_id);
                self.dispatcher
                    .execute(node_id, action, &prior)
                    .await
                    .map_err(|e| e.to_string())
            }
            trigger => Ok(trigger_output(self.job, node_id, trigger)),
        };

        let (status, output) = match &result {
            Ok(output) => (NodeStatus::Completed, output.clone()),
            Err(message) => (
                NodeStatus::Failed,
                json!({ "error": message, "timestamp": Utc::now(), "nodeId": node_id }),
            ),
        };
        self.outputs.insert(node_id.to_owned(), output.clone());
        self.results.push(NodeResult {
            node_id: node_id.to_owned(),
            status,
            output,
            executed_at: Utc::now(),
        });

        result
    }
}

/// Every output so far, plus `previousNode` when exactly one edge feeds `node_id`.
fn prior_outputs(graph: &Graph, outputs: &Map<String, Value>, node_id: &str) -> Value {
    let mut prior = outputs.clone();
    if let [parent] = graph.predecessors(node_id).as_slice() {
        if let Some(parent_output) = outputs.get(*parent) {
            prior.insert(PREVIOUS_NODE_KEY.to_owned(), parent_output.clone());
        }
    }
    Value::Object(prior)
}

/// Output of a trigger node, built from the job alone.
fn trigger_output(job: &ExecutionJob, node_id: &str, kind: &NodeKind) -> Value {
    let trigger = job.trigger_data.clone().unwrap_or_default();
    let now = Utc::now();

    match kind {
        NodeKind::WebhookTrigger => json!({
            "webhookPayload": trigger.webhook_payload,
            "payload": trigger.webhook_payload,
            "triggerSource": trigger.ip,
            "method": trigger.method,
            "queryParams": trigger.query_params,
            "headers": trigger.headers,
            "timestamp": now,
        }),
        NodeKind::ScheduleTrigger { .. } => {
            let metadata = job.metadata.clone().unwrap_or_default();
            json!({
                "triggeredBy": "schedule",
                "timestamp": now,
                "executionId": job.execution_id,
                "scheduledTime": metadata.scheduled_time,
                "nodeId": metadata.node_id.unwrap_or_else(|| node_id.to_owned()),
            })
        }
        NodeKind::EmailTrigger { .. } => {
            let email = trigger.email_data.unwrap_or(Value::Null);
            json!({
                "triggeredBy": "email",
                "timestamp": now,
                "executionId": job.execution_id,
                "from": email.get("from").cloned().unwrap_or(Value::Null),
                "subject": email.get("subject").cloned().unwrap_or(Value::Null),
                "content": email.get("body").cloned().unwrap_or(Value::Null),
                "emailData": email,
            })
        }
        NodeKind::ManualTrigger | NodeKind::Action(_) => json!({
            "triggeredBy": "manual",
            "timestamp": now,
            "executionId": job.execution_id,
        }),
    }
}

fn new_record(
    job: &ExecutionJob,
    status: ExecutionStatus,
    started_at: DateTime<Utc>,
) -> ExecutionRecord {
    ExecutionRecord {
        id: job.execution_id,
        workflow_id: job.workflow_id,
        workflow_name: job.workflow.name.clone(),
        user_id: job.user_id,
        triggered_by: job.triggered_by.to_string(),
        status,
        started_at,
        completed_at: None,
        duration_ms: None,
        node_results: Vec::new(),
        error: None,
        failed_node_id: None,
    }
}

fn elapsed_ms(clock: Instant) -> i64 {
    i64::try_from(clock.elapsed().as_millis()).unwrap_or(i64::MAX)
}
