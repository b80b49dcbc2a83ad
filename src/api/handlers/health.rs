use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::services::WorkerHealth;
use crate::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub store: &'static str,
    pub workers: Vec<WorkerHealth>,
}

/// Store connectivity plus the last cycle of every worker. 503 when degraded.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = %e, "Health check: store unreachable");
            false
        }
    };
    let workers = state.health.snapshot().await;
    let degraded = !store_ok || state.health.is_degraded().await;

    let report = HealthReport {
        status: if degraded { "degraded" } else { "healthy" },
        store: if store_ok { "connected" } else { "unreachable" },
        workers,
    };
    let status = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}

pub async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics_handle.render(),
    )
}
