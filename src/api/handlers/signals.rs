use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use super::{ok, ApiResponse, LimitQuery};
use crate::errors::AppError;
use crate::models::{AlphaSource, IntegrityRejection, Signal};
use crate::AppState;

pub async fn list_signals(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<ApiResponse<Vec<Signal>>>, AppError> {
    Ok(ok(state.store.recent_signals(q.resolve()).await?))
}

pub async fn get_signal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Signal>>, AppError> {
    let signal = state
        .store
        .get_signal(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("signal {id}")))?;
    Ok(ok(signal))
}

pub async fn list_alpha_sources(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<AlphaSource>>>, AppError> {
    Ok(ok(state.store.list_alpha_sources().await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveBody {
    pub is_active: bool,
}

/// Pause or resume trading on a source. Sources are never deleted.
pub async fn set_alpha_source_active(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ActiveBody>,
) -> Result<Json<ApiResponse<AlphaSource>>, AppError> {
    if !state.store.set_alpha_source_active(id, body.is_active).await? {
        return Err(AppError::NotFound(format!("alpha source {id}")));
    }
    tracing::info!(alpha_source_id = %id, is_active = body.is_active, "Alpha source toggled");
    let source = state
        .store
        .get_alpha_source(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("alpha source {id}")))?;
    Ok(ok(source))
}

pub async fn list_integrity_rejections(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<ApiResponse<Vec<IntegrityRejection>>>, AppError> {
    Ok(ok(state.store.recent_integrity_rejections(q.resolve()).await?))
}
