use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use validator::Validate;

use crate::models::{Channel, EventKind, NotificationEvent, Payload, Target};
use crate::services::{BatchEntry, BatchReport, DispatchReport};
use crate::startup::AppState;
use service_core::error::AppError;

const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Deserialize, Validate)]
pub struct DispatchRequest {
    /// Reusing an id re-sends only deliveries that have not succeeded yet.
    #[validate(length(min = 1, max = 128))]
    pub event_id: Option<String>,
    pub kind: EventKind,
    pub target: Target,
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(length(max = 2000))]
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub channels: BTreeSet<Channel>,
}

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub event_id: String,
    #[serde(flatten)]
    pub report: DispatchReport,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub entries: Vec<BatchEntry>,
}

#[tracing::instrument(skip(state, body), fields(kind = %body.kind))]
pub async fn dispatch_notification(
    State(state): State<AppState>,
    Json(body): Json<DispatchRequest>,
) -> Result<(StatusCode, Json<DispatchResponse>), AppError> {
    body.validate()?;

    let mut event = NotificationEvent::new(
        body.kind,
        body.target,
        Payload {
            title: body.title,
            body: body.body,
            data: body.data,
        },
        body.channels,
    );
    if let Some(event_id) = body.event_id {
        event.event_id = event_id;
    }
    let event_id = event.event_id.clone();

    let report = state.access.dispatch_notification(event).await?;
    Ok((StatusCode::ACCEPTED, Json(DispatchResponse { event_id, report })))
}

#[tracing::instrument(skip(state, body), fields(entries = body.entries.len()))]
pub async fn batch_send(
    State(state): State<AppState>,
    Json(body): Json<BatchRequest>,
) -> Result<(StatusCode, Json<BatchReport>), AppError> {
    if body.entries.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "At least one entry must be provided"
        )));
    }
    if body.entries.len() > MAX_BATCH_SIZE {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Maximum {} entries per batch",
            MAX_BATCH_SIZE
        )));
    }

    let report = state.access.batch_send(body.entries).await?;
    Ok((StatusCode::ACCEPTED, Json(report)))
}
