use axum::{extract::State, Json};
use serde::Deserialize;
use validator::Validate;

use crate::services::TokenValidation;
use crate::startup::AppState;
use service_core::error::AppError;

#[derive(Debug, Deserialize, Validate)]
pub struct ValidateTokenRequest {
    #[validate(length(max = 8192))]
    pub token: String,
}

/// Always 200 for a well-formed request; an unusable token is reported in
/// the body, not as an HTTP error.
#[tracing::instrument(skip(state, body))]
pub async fn validate_token(
    State(state): State<AppState>,
    Json(body): Json<ValidateTokenRequest>,
) -> Result<Json<TokenValidation>, AppError> {
    body.validate()?;

    let validation = state.access.validate_access_token(&body.token).await?;
    Ok(Json(validation))
}
