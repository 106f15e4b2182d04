//! Access request lifecycle.
//!
//! ```text
//! pending ──grant──▶ granted ──close──▶ expired | revoked
//!    └────deny────▶ denied
//! ```
//!
//! `decide` is the only way out of `pending`; once a request leaves it, later
//! decisions are refused without touching the record.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use validator::Validate;

use crate::config::TokenConfig;
use crate::error::AccessError;
use crate::models::{AccessRequest, AuditAction, AuditRecord, Hold, NewHold, Outcome, RequestStatus};
use crate::services::directory::Directory;
use crate::services::hold_ledger::HoldLedger;
use crate::services::metrics;
use crate::services::store::{AuditStore, RequestStore};
use crate::services::token_codec::TokenCodec;

/// Reason recorded when a grant is turned into a denial because the door is taken.
pub const RESOURCE_HELD: &str = "resource-held";
/// Revocation reason for a hold created by a grant that lost its write.
pub const DECISION_CONFLICT: &str = "decision-conflict";

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SubmitAccess {
    #[validate(length(min = 1, max = 128))]
    pub user_id: String,
    #[validate(length(min = 1, max = 128))]
    pub door_id: String,
    #[validate(length(min = 1, max = 128))]
    pub site_id: String,
    #[validate(length(min = 1, max = 32))]
    pub permissions: BTreeSet<String>,
    #[validate(range(min = 1))]
    pub ttl_minutes: Option<i64>,
}

/// What `decide` did.
#[derive(Debug, Clone)]
pub struct Decision {
    pub request: AccessRequest,
    pub hold: Option<Hold>,
    pub token: Option<String>,
}

impl Decision {
    pub fn granted(&self) -> bool {
        self.request.status == RequestStatus::Granted
    }
}

pub struct AccessRequestMachine {
    requests: Arc<dyn RequestStore>,
    audit: Arc<dyn AuditStore>,
    ledger: HoldLedger,
    codec: TokenCodec,
    directory: Arc<dyn Directory>,
    token_config: TokenConfig,
}

impl AccessRequestMachine {
    pub fn new(
        requests: Arc<dyn RequestStore>,
        audit: Arc<dyn AuditStore>,
        ledger: HoldLedger,
        codec: TokenCodec,
        directory: Arc<dyn Directory>,
        token_config: TokenConfig,
    ) -> Self {
        Self {
            requests,
            audit,
            ledger,
            codec,
            directory,
            token_config,
        }
    }

    #[tracing::instrument(skip(self, input), fields(user_id = %input.user_id, door_id = %input.door_id))]
    pub async fn submit(
        &self,
        input: SubmitAccess,
        now: DateTime<Utc>,
    ) -> Result<AccessRequest, AccessError> {
        input
            .validate()
            .map_err(|e| AccessError::validation(e.to_string()))?;

        let user_id = input.user_id.trim();
        if user_id.is_empty() {
            return Err(AccessError::validation("user_id must not be blank"));
        }

        let permissions: BTreeSet<String> = input
            .permissions
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if permissions.is_empty() {
            return Err(AccessError::validation("at least one permission is required"));
        }

        if self.directory.site(&input.site_id).is_none() {
            return Err(AccessError::validation(format!(
                "unknown site {}",
                input.site_id
            )));
        }
        if !self.directory.has_door(&input.site_id, &input.door_id) {
            return Err(AccessError::validation(format!(
                "door {} is not registered at site {}",
                input.door_id, input.site_id
            )));
        }

        if let Some(ttl) = input.ttl_minutes {
            if ttl > self.token_config.max_ttl_minutes {
                return Err(AccessError::validation(format!(
                    "ttl_minutes may not exceed {}",
                    self.token_config.max_ttl_minutes
                )));
            }
        }

        let request = AccessRequest::new(
            user_id.to_string(),
            input.door_id,
            input.site_id,
            permissions,
            input.ttl_minutes,
            now,
        );
        self.requests.insert_request(&request).await?;
        self.log_event(&request.request_id, AuditAction::Submitted, None)
            .await;

        tracing::info!(request_id = %request.request_id, "Access request submitted");
        Ok(request)
    }

    pub async fn get(&self, request_id: &str) -> Result<AccessRequest, AccessError> {
        self.requests
            .get_request(request_id)
            .await?
            .ok_or_else(|| AccessError::not_found(format!("access request {}", request_id)))
    }

    #[tracing::instrument(skip(self, reason))]
    pub async fn decide(
        &self,
        request_id: &str,
        outcome: Outcome,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Decision, AccessError> {
        let request = self.get(request_id).await?;
        if request.status != RequestStatus::Pending {
            return Err(AccessError::invalid_state(format!(
                "request {} is already {}",
                request_id, request.status
            )));
        }

        match outcome {
            Outcome::Deny => self.deny(&request, reason, now).await,
            Outcome::Grant => self.grant(&request, now).await,
        }
    }

    async fn grant(
        &self,
        request: &AccessRequest,
        now: DateTime<Utc>,
    ) -> Result<Decision, AccessError> {
        if let Some(existing) = self.ledger.live_hold_for(&request.door_id).await? {
            return self.refuse_held(request, &existing, now).await;
        }

        let ttl_minutes = request
            .ttl_minutes
            .unwrap_or(self.token_config.default_ttl_minutes);
        let created = self
            .ledger
            .create(
                NewHold {
                    request_id: request.request_id.clone(),
                    resource_id: request.door_id.clone(),
                    user_id: request.user_id.clone(),
                    site_id: request.site_id.clone(),
                    permissions: request.permissions.clone(),
                    ttl: Duration::minutes(ttl_minutes),
                },
                now,
            )
            .await;

        let hold = match created {
            Ok(hold) => hold,
            Err(AccessError::ResourceBusy(msg)) => {
                tracing::info!(request_id = %request.request_id, %msg, "Lost race for door");
                return match self.ledger.live_hold_for(&request.door_id).await? {
                    Some(existing) => self.refuse_held(request, &existing, now).await,
                    None => {
                        self.deny(request, Some(RESOURCE_HELD.to_string()), now)
                            .await
                    }
                };
            }
            Err(e) => return Err(e),
        };

        let token = match self.codec.issue_for_hold(&hold, now) {
            Ok(token) => token,
            Err(e) => {
                self.release_orphan(&hold, now).await;
                return Err(e);
            }
        };

        let granted = request.granted(&hold.hold_id, now);
        match self.requests.swap_request(request.version, &granted).await {
            Ok(true) => {}
            Ok(false) => {
                self.release_orphan(&hold, now).await;
                return Err(AccessError::invalid_state(format!(
                    "request {} was decided concurrently",
                    request.request_id
                )));
            }
            Err(e) => {
                self.release_orphan(&hold, now).await;
                return Err(e.into());
            }
        }

        metrics::record_decision("granted");
        self.log_event(&granted.request_id, AuditAction::Granted, None)
            .await;
        self.log_event(&granted.request_id, AuditAction::TokenIssued, Some(&token))
            .await;

        tracing::info!(
            request_id = %granted.request_id,
            hold_id = %hold.hold_id,
            "Access request granted"
        );

        Ok(Decision {
            request: granted,
            hold: Some(hold),
            token: Some(token),
        })
    }

    /// The door is held. A hold created for this very request means another
    /// grant of it is in progress, which is a conflict rather than a denial.
    async fn refuse_held(
        &self,
        request: &AccessRequest,
        existing: &Hold,
        now: DateTime<Utc>,
    ) -> Result<Decision, AccessError> {
        if existing.request_id == request.request_id {
            return Err(AccessError::invalid_state(format!(
                "request {} is being decided concurrently",
                request.request_id
            )));
        }

        tracing::info!(
            request_id = %request.request_id,
            held_by = %existing.hold_id,
            "Door already held, denying"
        );
        self.deny(request, Some(RESOURCE_HELD.to_string()), now)
            .await
    }

    async fn deny(
        &self,
        request: &AccessRequest,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Decision, AccessError> {
        let denied = request.denied(reason, now);
        if !self.requests.swap_request(request.version, &denied).await? {
            return Err(AccessError::invalid_state(format!(
                "request {} was decided concurrently",
                request.request_id
            )));
        }

        metrics::record_decision("denied");
        self.log_event(&denied.request_id, AuditAction::Denied, None)
            .await;

        tracing::info!(
            request_id = %denied.request_id,
            reason = denied.reason.as_deref().unwrap_or(""),
            "Access request denied"
        );

        Ok(Decision {
            request: denied,
            hold: None,
            token: None,
        })
    }

    /// Revoke a hold whose grant never committed. Nobody was told about the
    /// hold, so its revocation is not announced either.
    async fn release_orphan(&self, hold: &Hold, now: DateTime<Utc>) {
        if let Err(e) = self.ledger.revoke(&hold.hold_id, DECISION_CONFLICT, now).await {
            tracing::error!(
                hold_id = %hold.hold_id,
                error = %e,
                "Failed to revoke hold left behind by a failed grant"
            );
        }
    }

    /// Close a granted request once its hold ends. Closing into the state the
    /// request is already in is a no-op.
    pub async fn close(
        &self,
        request_id: &str,
        status: RequestStatus,
        now: DateTime<Utc>,
    ) -> Result<AccessRequest, AccessError> {
        if !matches!(status, RequestStatus::Expired | RequestStatus::Revoked) {
            return Err(AccessError::validation(format!(
                "requests can only be closed as expired or revoked, not {}",
                status
            )));
        }

        loop {
            let current = self.get(request_id).await?;
            if current.status == status {
                return Ok(current);
            }
            if current.status != RequestStatus::Granted {
                return Err(AccessError::invalid_state(format!(
                    "request {} is {} and cannot become {}",
                    request_id, current.status, status
                )));
            }

            let closed = current.closed(status, now);
            if self.requests.swap_request(current.version, &closed).await? {
                tracing::info!(request_id = %request_id, status = %status, "Access request closed");
                return Ok(closed);
            }
        }
    }

    /// Append to the audit trail. Failures are logged and otherwise ignored.
    pub async fn log_event(&self, request_id: &str, action: AuditAction, token: Option<&str>) {
        let record = AuditRecord::new(request_id, action, token);
        if let Err(e) = self.audit.append(&record).await {
            tracing::warn!(
                request_id = %request_id,
                action = ?action,
                error = %e,
                "Failed to append audit record"
            );
        }
    }
}
