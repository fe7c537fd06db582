//! `api` crate: HTTP intake for executions.
//!
//! Exposes:
//!   GET|POST /webhook/:workflow_id/:node_id
//!   POST     /workflows/:workflow_id/execute
//!   POST     /workflows/:workflow_id/schedule/refresh
//!   GET      /health

pub mod error;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use db::WorkflowStore;
use engine::ExecutionJob;
use queue::{EventBus, JobQueue};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub use error::ApiError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub workflows: Arc<dyn WorkflowStore>,
    pub queue: Arc<dyn JobQueue<ExecutionJob>>,
    pub bus: Arc<dyn EventBus>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/webhook/:workflow_id/:node_id",
            post(handlers::webhooks::receive).get(handlers::webhooks::receive),
        )
        .route(
            "/workflows/:workflow_id/execute",
            post(handlers::executions::execute),
        )
        .route(
            "/workflows/:workflow_id/schedule/refresh",
            post(handlers::workflows::refresh_schedule),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` fires, letting in-flight requests finish.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "intake API listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
}
