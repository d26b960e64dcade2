use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use common::{AckResponse, PushAssignRequest};

use crate::worker::AgentRuntime;

/// Router del listener push: el scheduler entrega jobs directamente.
pub fn build_push_router(runtime: Arc<AgentRuntime>) -> Router {
    Router::new()
        .route("/api/job/assign", post(assign_job))
        .with_state(runtime)
}

async fn assign_job(
    State(runtime): State<Arc<AgentRuntime>>,
    Json(req): Json<PushAssignRequest>,
) -> (StatusCode, Json<AckResponse>) {
    let Some(permit) = runtime.try_reserve() else {
        warn!("push de {} rechazado: sin cupos libres", req.execution_id);
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(AckResponse { ok: false }),
        );
    };

    info!("push recibido: {} (job '{}')", req.execution_id, req.job_id);
    runtime.spawn_job(req.execution_id, req.job, permit);
    (StatusCode::OK, Json(AckResponse { ok: true }))
}

pub async fn serve_push(
    runtime: Arc<AgentRuntime>,
    listen: String,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", listen))?;
    info!("listener push en {}", listener.local_addr()?);

    axum::serve(listener, build_push_router(runtime))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("error en el listener push")?;
    Ok(())
}
