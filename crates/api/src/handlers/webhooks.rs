use std::collections::HashMap;
use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, Method};
use axum::Json;
use chrono::Utc;
use engine::node::types::WEBHOOK_TRIGGER;
use engine::{submit, ExecutionJob, TriggerData, TriggeredBy, WorkflowDefinition};
use queue::Priority;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use super::{client_ip, header_str};
use crate::{ApiError, AppState};

/// `GET|POST /webhook/:workflow_id/:node_id`
///
/// Queues a webhook execution of the workflow. GET requests carry an empty
/// payload; a POST body that is not JSON is passed on as a string.
pub async fn receive(
    State(state): State<AppState>,
    Path((workflow_id, node_id)): Path<(Uuid, String)>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    info!(%workflow_id, %node_id, %method, "webhook received");

    let row = state
        .workflows
        .find(workflow_id)
        .await?
        .ok_or(ApiError::WorkflowNotFound(workflow_id))?;
    let definition = WorkflowDefinition::from_row(&row)?;
    if !definition
        .node(&node_id)
        .is_some_and(|n| n.node_type == WEBHOOK_TRIGGER)
    {
        return Err(ApiError::WebhookNodeNotFound(node_id));
    }

    let payload = if method == Method::GET || body.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()))
    };

    let trigger = TriggerData {
        node_id: Some(node_id),
        webhook_payload: Some(payload),
        query_params: Some(json!(query)),
        headers: Some(json!({
            "user-agent": header_str(&headers, "user-agent"),
            "content-type": header_str(&headers, "content-type"),
        })),
        method: Some(method.to_string()),
        ip: client_ip(&headers, peer.map(|ConnectInfo(addr)| addr)),
        ..Default::default()
    };
    let job = ExecutionJob::new(definition, row.user_id, TriggeredBy::Webhook)
        .with_priority(Priority::High)
        .with_trigger_data(trigger);
    let execution_id = job.execution_id;
    submit(state.queue.as_ref(), job).await?;

    Ok(Json(json!({
        "success": true,
        "message": "Webhook received and workflow execution queued",
        "executionId": execution_id,
        "workflowId": workflow_id,
        "timestamp": Utc::now(),
    })))
}
