use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ok, ApiResponse, LimitQuery};
use crate::errors::AppError;
use crate::execution::ReconcileOutcome;
use crate::models::{IntentState, TradeIntent};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct IntentQuery {
    pub state: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(q): Query<IntentQuery>,
) -> Result<Json<ApiResponse<Vec<TradeIntent>>>, AppError> {
    let filter = match q.state.as_deref() {
        Some(raw) => Some(
            IntentState::from_str(raw)
                .ok_or_else(|| AppError::BadRequest(format!("unknown intent state {raw:?}")))?,
        ),
        None => None,
    };
    let limit = LimitQuery { limit: q.limit }.resolve();
    Ok(ok(state.store.list_intents(filter, limit).await?))
}

pub async fn detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<TradeIntent>>, AppError> {
    let intent = state
        .store
        .get_intent(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("intent {id}")))?;
    Ok(ok(intent))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResult {
    pub outcome: &'static str,
    pub position_id: Option<Uuid>,
    pub reason: Option<String>,
}

/// Resolve an AMBIGUOUS intent against the venue.
pub async fn reconcile(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<ReconcileResult>>, AppError> {
    let result = match state.pipeline.executor.reconcile(id).await? {
        ReconcileOutcome::Opened(position_id) => ReconcileResult {
            outcome: "open",
            position_id: Some(position_id),
            reason: None,
        },
        ReconcileOutcome::Failed(reason) => ReconcileResult {
            outcome: "failed",
            position_id: None,
            reason: Some(reason),
        },
        ReconcileOutcome::StillPending => ReconcileResult {
            outcome: "pending",
            position_id: None,
            reason: None,
        },
    };
    Ok(ok(result))
}
