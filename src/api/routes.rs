//! Route handlers for the bounty settlement API.
//!
//! Administrators get explicit failure reasons for settle / record-payment
//! calls. Ordinary participants never see settlement errors: the finish
//! handler reports only the participant's own transition, and trigger
//! failures are contained inside the store.

use crate::api::AppState;
use crate::settlement::{
    self, determine_winners, RankedWinner, SettlementError, SettlementResult,
};
use crate::store::{Bounty, FinishOutcome, NewBounty, Participant, UserStats};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn error_response(err: SettlementError) -> ApiError {
    let status = match &err {
        SettlementError::BountyNotFound | SettlementError::ParticipantNotFound => {
            StatusCode::NOT_FOUND
        }
        SettlementError::InvalidRewardPool => StatusCode::BAD_REQUEST,
        SettlementError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::CONFLICT,
    };
    (
        status,
        Json(json!({
            "error": err.to_string(),
            "retryable": err.is_retryable(),
        })),
    )
}

pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// ----------------------------------------------------------------------
// Bounty lifecycle
// ----------------------------------------------------------------------

pub async fn create_bounty(
    State(state): State<AppState>,
    Json(new): Json<NewBounty>,
) -> ApiResult<Bounty> {
    state
        .store
        .create_bounty(new)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn get_bounty(
    State(state): State<AppState>,
    Path(bounty_id): Path<String>,
) -> ApiResult<Bounty> {
    match state.store.get_bounty(&bounty_id).await {
        Ok(Some(bounty)) => Ok(Json(bounty)),
        Ok(None) => Err(error_response(SettlementError::BountyNotFound)),
        Err(err) => Err(error_response(err)),
    }
}

pub async fn activate_bounty(
    State(state): State<AppState>,
    Path(bounty_id): Path<String>,
) -> ApiResult<Bounty> {
    state
        .store
        .activate_bounty(&bounty_id)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn cancel_bounty(
    State(state): State<AppState>,
    Path(bounty_id): Path<String>,
) -> ApiResult<Bounty> {
    state
        .store
        .cancel_bounty(&bounty_id)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn expire_bounty(
    State(state): State<AppState>,
    Path(bounty_id): Path<String>,
) -> ApiResult<Bounty> {
    state
        .store
        .expire_bounty(&bounty_id)
        .await
        .map(Json)
        .map_err(error_response)
}

// ----------------------------------------------------------------------
// Participation
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub user_id: String,
}

pub async fn join_bounty(
    State(state): State<AppState>,
    Path(bounty_id): Path<String>,
    Json(req): Json<JoinRequest>,
) -> ApiResult<Participant> {
    state
        .store
        .join_bounty(&bounty_id, &req.user_id)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn leave_bounty(
    State(state): State<AppState>,
    Path(bounty_id): Path<String>,
    Json(req): Json<JoinRequest>,
) -> ApiResult<Value> {
    state
        .store
        .leave_bounty(&bounty_id, &req.user_id)
        .await
        .map(|_| Json(json!({ "left": true })))
        .map_err(error_response)
}

#[derive(Debug, Deserialize)]
pub struct FinishRequest {
    pub user_id: String,
    pub attempts_used: i64,
    pub elapsed_seconds: f64,
    pub correct_count: i64,
}

/// Gameplay reports a participant finishing. The auto-completion trigger
/// runs inside the store; its failures never surface here.
pub async fn finish_participant(
    State(state): State<AppState>,
    Path(bounty_id): Path<String>,
    Json(req): Json<FinishRequest>,
) -> ApiResult<FinishOutcome> {
    state
        .store
        .finish_participant(
            &bounty_id,
            &req.user_id,
            req.attempts_used,
            req.elapsed_seconds,
            req.correct_count,
        )
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn list_participants(
    State(state): State<AppState>,
    Path(bounty_id): Path<String>,
) -> ApiResult<Vec<Participant>> {
    state
        .store
        .list_participants(&bounty_id)
        .await
        .map(Json)
        .map_err(error_response)
}

// ----------------------------------------------------------------------
// Settlement (administrative)
// ----------------------------------------------------------------------

pub async fn settle_bounty(
    State(state): State<AppState>,
    Path(bounty_id): Path<String>,
) -> ApiResult<SettlementResult> {
    settlement::settle(&state.store, &bounty_id)
        .await
        .map(Json)
        .map_err(error_response)
}

#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub bounty_id: String,
    pub winners: Vec<RankedWinner>,
}

/// Dry-run winner determination: rank current finishers without writing
/// anything. Safe to call repeatedly; an empty winner list means nobody has
/// finished yet.
pub async fn preview_winners(
    State(state): State<AppState>,
    Path(bounty_id): Path<String>,
) -> ApiResult<PreviewResponse> {
    let bounty = match state.store.get_bounty(&bounty_id).await {
        Ok(Some(bounty)) => bounty,
        Ok(None) => return Err(error_response(SettlementError::BountyNotFound)),
        Err(err) => return Err(error_response(err)),
    };
    let participants = state
        .store
        .list_participants(&bounty_id)
        .await
        .map_err(error_response)?;

    let snapshots: Vec<_> = participants
        .into_iter()
        .map(|p| crate::settlement::ParticipantSnapshot {
            user_id: p.user_id,
            status: p.status,
            finished_at: p.finished_at,
            attempts_used: p.attempts_used,
            elapsed_seconds: p.elapsed_seconds,
            correct_count: p.correct_count,
        })
        .collect();

    let winners = match determine_winners(&bounty.config(), &snapshots) {
        Ok(winners) => winners,
        Err(SettlementError::NoEligibleWinners) => Vec::new(),
        Err(err) => return Err(error_response(err)),
    };

    Ok(Json(PreviewResponse { bounty_id, winners }))
}

pub async fn list_winners(
    State(state): State<AppState>,
    Path(bounty_id): Path<String>,
) -> ApiResult<Vec<settlement::SettledWinner>> {
    state
        .store
        .list_winners(&bounty_id)
        .await
        .map(Json)
        .map_err(error_response)
}

// ----------------------------------------------------------------------
// Payment reconciliation (administrative)
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RecordPaymentRequest {
    pub user_id: String,
    pub payment_reference: String,
}

pub async fn record_payment(
    State(state): State<AppState>,
    Path(bounty_id): Path<String>,
    Json(req): Json<RecordPaymentRequest>,
) -> ApiResult<Participant> {
    settlement::record_payment(&state.store, &bounty_id, &req.user_id, &req.payment_reference)
        .await
        .map(Json)
        .map_err(error_response)
}

// ----------------------------------------------------------------------
// User aggregates
// ----------------------------------------------------------------------

pub async fn get_user_stats(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<UserStats> {
    state
        .store
        .get_user_stats(&user_id)
        .await
        .map(Json)
        .map_err(error_response)
}
