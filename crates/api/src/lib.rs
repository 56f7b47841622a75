//! `api` crate — HTTP REST API layer.
//!
//! Exposes:
//!   GET    /api/v1/workflows
//!   POST   /api/v1/workflows/{name}/run
//!   GET    /api/v1/workflows/{name}/executions
//!   GET    /api/v1/executions[?workflow=name]
//!   GET    /api/v1/executions/{id}
//!   POST   /api/v1/executions/{id}/cancel
//!   POST   /api/v1/webhook/{*path}
//!   POST   /api/v1/git/push
//!   GET    /api/v1/tasks
//!   POST   /api/v1/tasks

mod error;
pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use engine::{ExecutionCoordinator, Scheduler};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: ExecutionCoordinator,
    pub scheduler: Scheduler,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/workflows", get(handlers::workflows::list))
        .route("/workflows/{name}/run", post(handlers::workflows::run))
        .route("/workflows/{name}/executions", get(handlers::workflows::executions))
        .route("/executions", get(handlers::executions::list))
        .route("/executions/{id}", get(handlers::executions::get))
        .route("/executions/{id}/cancel", post(handlers::executions::cancel))
        .route("/webhook/{*path}", post(handlers::webhooks::handle_webhook))
        .route("/git/push", post(handlers::webhooks::git_push))
        .route(
            "/tasks",
            get(handlers::tasks::list).post(handlers::tasks::create),
        );

    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "api listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
