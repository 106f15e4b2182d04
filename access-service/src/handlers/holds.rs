use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use validator::Validate;

use crate::models::{Hold, HoldStatus};
use crate::startup::AppState;
use service_core::error::AppError;

#[derive(Debug, Serialize)]
pub struct HoldResponse {
    pub hold_id: String,
    pub request_id: String,
    pub resource_id: String,
    pub user_id: String,
    pub site_id: String,
    pub permissions: BTreeSet<String>,
    pub status: HoldStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub extension_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl From<Hold> for HoldResponse {
    fn from(h: Hold) -> Self {
        Self {
            hold_id: h.hold_id,
            request_id: h.request_id,
            resource_id: h.resource_id,
            user_id: h.user_id,
            site_id: h.site_id,
            permissions: h.permissions,
            status: h.status,
            created_at: h.created_at,
            expires_at: h.expires_at,
            extension_count: h.extension_count,
            revoked_reason: h.revoked_reason,
            closed_at: h.closed_at,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct ExtendRequest {
    #[validate(range(min = 1))]
    pub minutes: i64,
}

#[derive(Debug, Serialize)]
pub struct ExtendResponse {
    pub success: bool,
    pub new_expires_at: DateTime<Utc>,
    pub hold: HoldResponse,
    /// Replacement token carrying the new expiry.
    pub token: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RevokeRequest {
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

#[tracing::instrument(skip(state))]
pub async fn get_hold(
    State(state): State<AppState>,
    Path(hold_id): Path<String>,
) -> Result<Json<HoldResponse>, AppError> {
    let hold = state.access.get_hold(&hold_id).await?;
    Ok(Json(hold.into()))
}

#[tracing::instrument(skip(state, body), fields(minutes = body.minutes))]
pub async fn extend_hold(
    State(state): State<AppState>,
    Path(hold_id): Path<String>,
    Json(body): Json<ExtendRequest>,
) -> Result<Json<ExtendResponse>, AppError> {
    body.validate()?;

    let extended = state.access.extend_hold(&hold_id, body.minutes).await?;
    Ok(Json(ExtendResponse {
        success: true,
        new_expires_at: extended.new_expires_at,
        hold: extended.hold.into(),
        token: extended.token,
    }))
}

#[tracing::instrument(skip(state, body))]
pub async fn revoke_hold(
    State(state): State<AppState>,
    Path(hold_id): Path<String>,
    Json(body): Json<RevokeRequest>,
) -> Result<Json<HoldResponse>, AppError> {
    body.validate()?;

    let hold = state.access.revoke_hold(&hold_id, &body.reason).await?;
    Ok(Json(hold.into()))
}
