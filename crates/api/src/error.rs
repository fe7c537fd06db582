//! Request errors and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),

    #[error("webhook trigger node '{0}' not found in workflow")]
    WebhookNodeNotFound(String),

    #[error("invalid request body: {0}")]
    BadRequest(String),

    #[error("stored workflow is malformed: {0}")]
    Engine(#[from] engine::EngineError),

    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("queue error: {0}")]
    Queue(#[from] queue::QueueError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::WorkflowNotFound(_) | Self::WebhookNodeNotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Engine(_) | Self::Database(_) | Self::Queue(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
            "internal server error".to_owned()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}
