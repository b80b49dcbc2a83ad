use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{ok, ApiResponse, LimitQuery};
use crate::errors::AppError;
use crate::models::{AgentDeployment, PnlSnapshot};
use crate::AppState;

pub async fn list(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<AgentDeployment>>>, AppError> {
    Ok(ok(state.store.list_deployments().await?))
}

pub async fn detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<AgentDeployment>>, AppError> {
    let deployment = state
        .store
        .get_deployment(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("deployment {id}")))?;
    Ok(ok(deployment))
}

/// Create or replace a deployment. Preferences are stored as given; the sizer
/// rejects out-of-range values when the deployment is routed.
pub async fn upsert(
    State(state): State<AppState>,
    Json(deployment): Json<AgentDeployment>,
) -> Result<(StatusCode, Json<ApiResponse<AgentDeployment>>), AppError> {
    if deployment.user_id.trim().is_empty() {
        return Err(AppError::BadRequest("userId is required".into()));
    }
    if deployment.capital_usd < Decimal::ZERO {
        return Err(AppError::BadRequest("capitalUsd must not be negative".into()));
    }
    let saved = state.store.upsert_deployment(&deployment).await?;
    tracing::info!(
        deployment_id = %saved.id,
        user_id = %saved.user_id,
        sources = saved.alpha_source_ids.len(),
        "Deployment saved"
    );
    Ok((StatusCode::CREATED, ok(saved)))
}

/// Daily realised PnL, most recent day first.
pub async fn pnl_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<ApiResponse<Vec<PnlSnapshot>>>, AppError> {
    if state.store.get_deployment(id).await?.is_none() {
        return Err(AppError::NotFound(format!("deployment {id}")));
    }
    Ok(ok(state.store.pnl_history(id, q.resolve()).await?))
}
