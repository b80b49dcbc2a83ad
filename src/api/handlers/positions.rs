use axum::extract::{Path, Query, State};
use axum::Json;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use super::{ok, ApiResponse, LimitQuery};
use crate::errors::AppError;
use crate::execution::CloseOutcome;
use crate::models::{CloseReason, Position};
use crate::venues::CloseFill;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionQuery {
    #[serde(default)]
    pub open_only: bool,
    pub limit: Option<i64>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(q): Query<PositionQuery>,
) -> Result<Json<ApiResponse<Vec<Position>>>, AppError> {
    let limit = LimitQuery { limit: q.limit }.resolve();
    Ok(ok(state.store.list_positions(q.open_only, limit).await?))
}

pub async fn detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Position>>, AppError> {
    let position = state
        .store
        .get_position(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("position {id}")))?;
    Ok(ok(position))
}

/// Body of a close request. A venue-reported stop or take-profit hit carries
/// its fill price; a manual close asks the venue to close.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseBody {
    pub reason: Option<CloseReason>,
    pub exit_price: Option<Decimal>,
}

/// Closing an already-closed position returns it unchanged.
pub async fn close(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CloseBody>>,
) -> Result<Json<ApiResponse<Position>>, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let reason = body.reason.unwrap_or(CloseReason::Manual);

    let fill = match body.exit_price {
        Some(exit_price) if exit_price > Decimal::ZERO => {
            let position = state
                .store
                .get_position(id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("position {id}")))?;
            Some(CloseFill {
                exit_price,
                qty: position.qty,
            })
        }
        Some(bad) => return Err(AppError::BadRequest(format!("exitPrice {bad} must be positive"))),
        None => None,
    };

    let position = match state.pipeline.executor.close_position(id, reason, fill).await? {
        CloseOutcome::Closed(p) | CloseOutcome::AlreadyClosed(p) => p,
    };
    Ok(ok(position))
}
