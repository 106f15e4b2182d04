use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use validator::Validate;

use super::holds::HoldResponse;
use crate::models::{AccessRequest, Outcome, RequestStatus};
use crate::services::{Decision, SubmitAccess};
use crate::startup::AppState;
use service_core::error::AppError;

#[derive(Debug, Serialize)]
pub struct AccessRequestResponse {
    pub request_id: String,
    pub user_id: String,
    pub door_id: String,
    pub site_id: String,
    pub permissions: BTreeSet<String>,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl From<AccessRequest> for AccessRequestResponse {
    fn from(r: AccessRequest) -> Self {
        Self {
            request_id: r.request_id,
            user_id: r.user_id,
            door_id: r.door_id,
            site_id: r.site_id,
            permissions: r.permissions,
            status: r.status,
            ttl_minutes: r.ttl_minutes,
            reason: r.reason,
            hold_id: r.hold_id,
            created_at: r.created_at,
            decided_at: r.decided_at,
            closed_at: r.closed_at,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct DecisionRequest {
    pub outcome: Outcome,
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DecisionResponse {
    pub request: AccessRequestResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold: Option<HoldResponse>,
    /// Only present on a grant; never stored server-side.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl From<Decision> for DecisionResponse {
    fn from(d: Decision) -> Self {
        Self {
            request: d.request.into(),
            hold: d.hold.map(HoldResponse::from),
            token: d.token,
        }
    }
}

#[tracing::instrument(skip(state, request), fields(user_id = %request.user_id, door_id = %request.door_id))]
pub async fn submit_access_request(
    State(state): State<AppState>,
    Json(request): Json<SubmitAccess>,
) -> Result<(StatusCode, Json<AccessRequestResponse>), AppError> {
    request.validate()?;

    let created = state.access.submit_access_request(request).await?;
    Ok((StatusCode::CREATED, Json(created.into())))
}

#[tracing::instrument(skip(state))]
pub async fn get_access_request(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Json<AccessRequestResponse>, AppError> {
    let request = state.access.get_access_request(&request_id).await?;
    Ok(Json(request.into()))
}

#[tracing::instrument(skip(state, body), fields(outcome = ?body.outcome))]
pub async fn decide_access_request(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Json(body): Json<DecisionRequest>,
) -> Result<Json<DecisionResponse>, AppError> {
    body.validate()?;

    let decision = state
        .access
        .decide_access_request(&request_id, body.outcome, body.reason)
        .await?;
    Ok(Json(decision.into()))
}
