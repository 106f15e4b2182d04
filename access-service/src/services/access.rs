//! Caller-facing operations.
//!
//! Each operation runs under the configured operation timeout. Writes run on
//! their own task, so a timeout only stops the caller from waiting; it never
//! interrupts a write half way. Notifications go out on detached tasks after
//! the change commits. The caller waits for them only while the operation
//! budget lasts, and they never change the result.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::Instrument;

use crate::error::AccessError;
use crate::models::{
    AccessRequest, AuditAction, EventKind, Hold, NotificationEvent, Outcome, RequestStatus,
    SiteRole, Target,
};
use crate::services::directory::Directory;
use crate::services::dispatcher::{
    BatchEntry, BatchReport, DispatchReport, NotificationDispatcher, Notified,
};
use crate::services::hold_ledger::HoldLedger;
use crate::services::request_machine::{AccessRequestMachine, Decision, SubmitAccess};
use crate::services::sweeper::{ExpirySweeper, SweepReport};
use crate::services::token_codec::{TokenCodec, TokenRejection, TokenValidation};

/// Result of a successful extension, with a token matching the new expiry.
#[derive(Debug, Clone, Serialize)]
pub struct ExtendedHold {
    pub hold: Hold,
    pub new_expires_at: DateTime<Utc>,
    pub token: String,
}

pub struct AccessService {
    machine: Arc<AccessRequestMachine>,
    ledger: HoldLedger,
    codec: TokenCodec,
    directory: Arc<dyn Directory>,
    dispatcher: Arc<NotificationDispatcher>,
    sweeper: Arc<ExpirySweeper>,
    max_extension_minutes: i64,
    operation_timeout: Duration,
}

impl AccessService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        machine: Arc<AccessRequestMachine>,
        ledger: HoldLedger,
        codec: TokenCodec,
        directory: Arc<dyn Directory>,
        dispatcher: Arc<NotificationDispatcher>,
        sweeper: Arc<ExpirySweeper>,
        max_extension_minutes: i64,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            machine,
            ledger,
            codec,
            directory,
            dispatcher,
            sweeper,
            max_extension_minutes,
            operation_timeout,
        }
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    pub fn sweeper(&self) -> &Arc<ExpirySweeper> {
        &self.sweeper
    }

    pub async fn submit_access_request(
        &self,
        input: SubmitAccess,
    ) -> Result<AccessRequest, AccessError> {
        let machine = Arc::clone(&self.machine);
        self.committed("submit_access_request", async move {
            machine.submit(input, Utc::now()).await
        })
        .await
    }

    pub async fn get_access_request(&self, request_id: &str) -> Result<AccessRequest, AccessError> {
        self.bounded("get_access_request", self.machine.get(request_id))
            .await
    }

    #[tracing::instrument(skip(self, reason))]
    pub async fn decide_access_request(
        &self,
        request_id: &str,
        outcome: Outcome,
        reason: Option<String>,
    ) -> Result<Decision, AccessError> {
        let deadline = self.deadline();
        let machine = Arc::clone(&self.machine);
        let request_id = request_id.to_string();
        let decision = self
            .committed("decide_access_request", async move {
                machine.decide(&request_id, outcome, reason, Utc::now()).await
            })
            .await?;

        let event = match &decision.hold {
            Some(hold) => NotificationEvent::for_hold(
                EventKind::Granted,
                hold,
                self.requester_and_staff(hold, &[SiteRole::Manager, SiteRole::Responder]),
            ),
            None => NotificationEvent::denied(&decision.request),
        };
        Ok(self.announce(decision, event).settle_by(deadline).await)
    }

    /// Check a presented token. Token problems come back as
    /// [`TokenValidation::Invalid`]; only infrastructure failures are errors.
    #[tracing::instrument(skip(self, token))]
    pub async fn validate_access_token(&self, token: &str) -> Result<TokenValidation, AccessError> {
        self.bounded("validate_access_token", async {
            let now = Utc::now();
            let claims = match self.codec.decode_at(token, now) {
                Ok(claims) => claims,
                Err(reason) => {
                    tracing::debug!(reason = %reason, "Token rejected");
                    return Ok(TokenValidation::invalid(reason));
                }
            };

            let hold = match self.ledger.get(&claims.hold_id).await {
                Ok(hold) => hold,
                Err(AccessError::NotFound(_)) => {
                    return Ok(TokenValidation::invalid(TokenRejection::HoldInactive))
                }
                Err(e) => return Err(e),
            };

            let matches_hold = hold.user_id == claims.sub && hold.resource_id == claims.door_id;
            if !hold.is_live() || !matches_hold || hold.is_lapsed(now) {
                tracing::debug!(hold_id = %hold.hold_id, status = %hold.status, "Token names an inactive hold");
                return Ok(TokenValidation::invalid(TokenRejection::HoldInactive));
            }

            Ok(TokenValidation::valid(claims))
        })
        .await
    }

    /// Fetch a hold, expiring it first if its time is up but no sweep has
    /// reached it yet.
    pub async fn get_hold(&self, hold_id: &str) -> Result<Hold, AccessError> {
        let deadline = self.deadline();
        let ledger = self.ledger.clone();
        let sweeper = Arc::clone(&self.sweeper);
        let hold_id = hold_id.to_string();
        let fetched = self
            .committed("get_hold", async move {
                let now = Utc::now();
                let hold = ledger.get(&hold_id).await?;
                if !hold.is_due(now) {
                    return Ok(Notified::new(hold));
                }

                tracing::debug!(hold_id = %hold_id, "Lookup found a lapsed live hold, sweeping it");
                match sweeper.sweep_hold(&hold_id, now).await? {
                    Some(expired) => Ok(expired),
                    None => Ok(Notified::new(ledger.get(&hold_id).await?)),
                }
            })
            .await?;
        Ok(fetched.settle_by(deadline).await)
    }

    #[tracing::instrument(skip(self))]
    pub async fn extend_hold(
        &self,
        hold_id: &str,
        minutes: i64,
    ) -> Result<ExtendedHold, AccessError> {
        if minutes > self.max_extension_minutes {
            return Err(AccessError::validation(format!(
                "extension may not exceed {} minutes",
                self.max_extension_minutes
            )));
        }

        let deadline = self.deadline();
        let ledger = self.ledger.clone();
        let codec = self.codec.clone();
        let machine = Arc::clone(&self.machine);
        let hold_id = hold_id.to_string();
        let extended = self
            .committed("extend_hold", async move {
                let now = Utc::now();
                let outcome = ledger.extend(&hold_id, minutes, now).await?;
                let hold = outcome.hold;
                machine
                    .log_event(&hold.request_id, AuditAction::Extended, None)
                    .await;

                // The extension stands even if signing fails; the old token
                // stays valid until its own expiry.
                let token = codec.issue_for_hold(&hold, now)?;
                machine
                    .log_event(&hold.request_id, AuditAction::TokenReissued, Some(&token))
                    .await;

                Ok(ExtendedHold {
                    new_expires_at: outcome.new_expires_at,
                    hold,
                    token,
                })
            })
            .await?;

        let event = NotificationEvent::for_hold(
            EventKind::Extended,
            &extended.hold,
            Target::User {
                user_id: extended.hold.user_id.clone(),
            },
        );
        Ok(self.announce(extended, event).settle_by(deadline).await)
    }

    #[tracing::instrument(skip(self))]
    pub async fn revoke_hold(&self, hold_id: &str, reason: &str) -> Result<Hold, AccessError> {
        let reason = reason.trim().to_string();
        if reason.is_empty() {
            return Err(AccessError::validation("revocation reason is required"));
        }

        let deadline = self.deadline();
        let ledger = self.ledger.clone();
        let machine = Arc::clone(&self.machine);
        let hold_id = hold_id.to_string();
        let hold = self
            .committed("revoke_hold", async move {
                let now = Utc::now();
                let hold = ledger.revoke(&hold_id, &reason, now).await?;

                if let Err(e) = machine
                    .close(&hold.request_id, RequestStatus::Revoked, now)
                    .await
                {
                    tracing::warn!(
                        hold_id = %hold.hold_id,
                        request_id = %hold.request_id,
                        error = %e,
                        "Failed to close request for revoked hold"
                    );
                }
                machine
                    .log_event(&hold.request_id, AuditAction::Revoked, None)
                    .await;
                Ok(hold)
            })
            .await?;

        let event = NotificationEvent::for_hold(
            EventKind::Revoked,
            &hold,
            self.requester_and_staff(&hold, &[SiteRole::Manager]),
        );
        Ok(self.announce(hold, event).settle_by(deadline).await)
    }

    /// Expire due holds as of `now` (default: the current time), optionally
    /// followed by the expiring-soon pass.
    pub async fn run_sweep(
        &self,
        now: Option<DateTime<Utc>>,
        include_warnings: bool,
    ) -> Result<SweepReport, AccessError> {
        let deadline = self.deadline();
        let sweeper = Arc::clone(&self.sweeper);
        let swept = self
            .committed("run_sweep", async move {
                let now = now.unwrap_or_else(Utc::now);
                let mut swept = sweeper.start_sweep(now).await?;
                if include_warnings {
                    let warnings = sweeper.start_warnings(now).await?;
                    swept.value.warned = warnings.value.warned;
                    swept.value.errors += warnings.value.errors;
                    swept.deliveries.extend(warnings.deliveries);
                }
                Ok(swept)
            })
            .await?;
        Ok(swept.settle_by(deadline).await)
    }

    pub async fn dispatch_notification(
        &self,
        event: NotificationEvent,
    ) -> Result<DispatchReport, AccessError> {
        let dispatcher = Arc::clone(&self.dispatcher);
        self.committed("dispatch_notification", async move {
            dispatcher.send(event).await
        })
        .await
    }

    pub async fn batch_send(&self, entries: Vec<BatchEntry>) -> Result<BatchReport, AccessError> {
        let dispatcher = Arc::clone(&self.dispatcher);
        self.committed("batch_send", async move {
            Ok(dispatcher.batch_send(entries).await)
        })
        .await
    }

    /// The hold's user plus the site's staff in `roles`, each once.
    fn requester_and_staff(&self, hold: &Hold, roles: &[SiteRole]) -> Target {
        let mut seen = BTreeSet::new();
        let user_ids = std::iter::once(hold.user_id.clone())
            .chain(
                roles
                    .iter()
                    .flat_map(|role| self.directory.role_members(&hold.site_id, *role)),
            )
            .filter(|u| seen.insert(u.clone()))
            .collect();
        Target::Users { user_ids }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.operation_timeout
    }

    /// Start delivering `event` for a change that has committed.
    fn announce<T>(&self, value: T, event: NotificationEvent) -> Notified<T> {
        Notified::new(value).with(self.dispatcher.notify_detached(event))
    }

    /// Read-only work under the operation timeout. Dropping it on timeout
    /// loses nothing.
    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, AccessError>
    where
        F: Future<Output = Result<T, AccessError>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out(operation)),
        }
    }

    /// Work that writes, run on its own task. The caller stops waiting at the
    /// operation timeout but the task carries on, so a write sequence such
    /// as create-hold-then-mark-granted is never cut in half.
    async fn committed<T, F>(&self, operation: &'static str, fut: F) -> Result<T, AccessError>
    where
        F: Future<Output = Result<T, AccessError>> + Send + 'static,
        T: Send + 'static,
    {
        let task = tokio::spawn(fut.in_current_span());
        match tokio::time::timeout(self.operation_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
            Ok(Err(join)) => {
                tracing::error!(operation, error = %join, "Operation task cancelled");
                Err(self.timed_out(operation))
            }
            Err(_) => Err(self.timed_out(operation)),
        }
    }

    fn timed_out(&self, operation: &'static str) -> AccessError {
        let ms = self.operation_timeout.as_millis() as u64;
        tracing::warn!(operation, timeout_ms = ms, "Operation timed out");
        AccessError::Timeout(ms)
    }
}
