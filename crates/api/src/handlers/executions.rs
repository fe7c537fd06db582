use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use engine::{submit, ExecutionJob, ExecutionMetadata, TriggeredBy, WorkflowDefinition};
use queue::Priority;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{client_ip, header_str};
use crate::{ApiError, AppState};

/// Optional body of an execute request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    /// Only `manual` changes anything; every other value means `api`.
    #[serde(default)]
    pub triggered_by: Option<TriggeredBy>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

/// `POST /workflows/:workflow_id/execute`
pub async fn execute(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request: ExecuteRequest = if body.is_empty() {
        ExecuteRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };

    let row = state
        .workflows
        .find(workflow_id)
        .await?
        .ok_or(ApiError::WorkflowNotFound(workflow_id))?;
    let definition = WorkflowDefinition::from_row(&row)?;

    let triggered_by = match request.triggered_by {
        Some(TriggeredBy::Manual) => TriggeredBy::Manual,
        _ => TriggeredBy::Api,
    };
    let job = ExecutionJob::new(definition, row.user_id, triggered_by)
        .with_priority(request.priority.unwrap_or_default())
        .with_metadata(ExecutionMetadata {
            source: Some("api".into()),
            user_agent: header_str(&headers, "user-agent").map(str::to_owned),
            ip: client_ip(&headers, peer.map(|ConnectInfo(addr)| addr)),
            ..Default::default()
        });
    let execution_id = job.execution_id;
    submit(state.queue.as_ref(), job).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "message": "Workflow queued for execution",
            "executionId": execution_id,
            "workflowId": workflow_id,
            "status": "queued",
        })),
    ))
}
