use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use super::{ok, ApiResponse};
use crate::errors::AppError;
use crate::models::{Venue, WalletSlot};
use crate::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddWalletBody {
    pub venue: Venue,
    pub address: String,
    pub credential_ref: String,
}

/// Provision a new slot into the pool.
pub async fn add(
    State(state): State<AppState>,
    Json(body): Json<AddWalletBody>,
) -> Result<(StatusCode, Json<ApiResponse<WalletSlot>>), AppError> {
    if body.address.trim().is_empty() || body.credential_ref.trim().is_empty() {
        return Err(AppError::BadRequest("address and credentialRef are required".into()));
    }
    let slot = state
        .store
        .add_wallet(body.venue, body.address.trim(), body.credential_ref.trim())
        .await?;
    Ok((StatusCode::CREATED, ok(slot)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimBody {
    pub user_id: String,
    pub venue: Venue,
}

/// Hand the user a free slot for the venue, or the one they already hold.
pub async fn claim(
    State(state): State<AppState>,
    Json(body): Json<ClaimBody>,
) -> Result<Json<ApiResponse<WalletSlot>>, AppError> {
    if body.user_id.trim().is_empty() {
        return Err(AppError::BadRequest("userId is required".into()));
    }
    let slot = state
        .store
        .claim_wallet(body.user_id.trim(), body.venue)
        .await?
        .ok_or_else(|| AppError::Conflict(format!("no free {} wallet slot", body.venue)))?;
    tracing::info!(user_id = %body.user_id, venue = %body.venue, slot_id = %slot.id, "Wallet slot claimed");
    Ok(ok(slot))
}

pub async fn release(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<bool>>, AppError> {
    let released = state.store.release_wallet(id).await?;
    if released {
        tracing::info!(slot_id = %id, "Wallet slot released");
    }
    Ok(ok(released))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletQuery {
    pub user_id: String,
}

pub async fn for_user(
    State(state): State<AppState>,
    Query(q): Query<WalletQuery>,
) -> Result<Json<ApiResponse<Vec<WalletSlot>>>, AppError> {
    Ok(ok(state.store.wallets_for_user(&q.user_id).await?))
}
