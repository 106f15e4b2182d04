use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::services::SweepReport;
use crate::startup::AppState;
use service_core::error::AppError;

#[derive(Debug, Default, Deserialize)]
pub struct SweepRequest {
    /// Sweep as of this instant instead of the server clock.
    #[serde(default)]
    pub now: Option<DateTime<Utc>>,
    #[serde(default)]
    pub include_warnings: bool,
}

#[tracing::instrument(skip(state))]
pub async fn run_sweep(
    State(state): State<AppState>,
    Json(body): Json<SweepRequest>,
) -> Result<Json<SweepReport>, AppError> {
    let report = state
        .access
        .run_sweep(body.now, body.include_warnings)
        .await?;
    Ok(Json(report))
}
