//! `api` crate — HTTP REST API over the orchestrator.
//!
//! Exposes:
//!   POST   /api/v1/workflows
//!   GET    /api/v1/workflows?name=&version=
//!   POST   /api/v1/workflows/plan
//!   GET    /api/v1/workflows/{id}
//!   POST   /api/v1/workflows/{id}/runs
//!   GET    /api/v1/workflows/{id}/runs
//!   GET    /api/v1/runs/{id}
//!   POST   /api/v1/runs/{id}/cancel
//!   POST   /api/v1/runs/{id}/signals
//!   GET    /api/v1/runs/{id}/signals
//!   GET    /api/v1/runs/{id}/vars
//!   GET    /api/v1/runs/{id}/compensations
//!   GET    /healthz

pub mod error;
pub mod handlers {
    pub mod runs;
    pub mod workflows;
}

use std::future::Future;

use axum::{
    routing::{get, post},
    Router,
};
use engine::Orchestrator;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use error::{ApiError, ApiResult};
use handlers::{runs, workflows};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/workflows", post(workflows::create).get(workflows::list))
        .route("/workflows/plan", post(workflows::plan))
        .route("/workflows/{id}", get(workflows::get))
        .route("/workflows/{id}/runs", post(workflows::start_run).get(workflows::list_runs))
        .route("/runs/{id}", get(runs::get))
        .route("/runs/{id}/cancel", post(runs::cancel))
        .route("/runs/{id}/signals", post(runs::signal).get(runs::signals))
        .route("/runs/{id}/vars", get(runs::vars))
        .route("/runs/{id}/compensations", get(runs::compensations));

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `bind` until `shutdown` resolves.
pub async fn serve<F>(bind: &str, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
