use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use super::{ok, ApiResponse};
use crate::errors::AppError;
use crate::ingestion::NormalizeOutcome;
use crate::models::{ClassifiedCandidate, Signal};
use crate::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateResult {
    pub outcome: &'static str,
    pub signal: Option<Signal>,
    pub reason: Option<String>,
}

/// Intake for classifier output. Accepted → 201, skipped → 200,
/// integrity rejection → 422 (already audited).
pub async fn submit(
    State(state): State<AppState>,
    Json(candidate): Json<ClassifiedCandidate>,
) -> Result<(StatusCode, Json<ApiResponse<CandidateResult>>), AppError> {
    match state.pipeline.normalizer.normalize(&candidate).await? {
        NormalizeOutcome::Accepted(signal) => Ok((
            StatusCode::CREATED,
            ok(CandidateResult {
                outcome: "accepted",
                signal: Some(signal),
                reason: None,
            }),
        )),
        NormalizeOutcome::Skipped(reason) => Ok((
            StatusCode::OK,
            ok(CandidateResult {
                outcome: reason.label(),
                signal: None,
                reason: Some(format!("{reason:?}")),
            }),
        )),
        NormalizeOutcome::Rejected(reason) => Err(AppError::Unprocessable(reason)),
    }
}
