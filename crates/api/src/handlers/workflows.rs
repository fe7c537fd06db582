use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use tracing::info;
use triggers::SCHEDULE_REFRESH_CHANNEL;
use uuid::Uuid;

use crate::{ApiError, AppState};

/// `POST /workflows/:workflow_id/schedule/refresh`
///
/// Signals schedule registries that the workflow changed. Sent after a
/// workflow is created, edited, activated or deleted.
pub async fn refresh_schedule(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state
        .bus
        .publish(SCHEDULE_REFRESH_CHANNEL, json!({ "workflowId": workflow_id }))
        .await?;
    info!(%workflow_id, "schedule refresh signalled");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "workflowId": workflow_id })),
    ))
}
