//! Hold lifecycle: exclusive creation plus every later transition.
//!
//! All mutations funnel through [`HoldLedger::transition`], which reads the
//! hold, lets the caller compute the next state against what it read, and
//! writes it back only if nobody else wrote in between. A stale write re-reads
//! and re-decides, so a sweep that selected a hold before it was extended
//! sees the new expiry and leaves it alone.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::error::AccessError;
use crate::models::{Hold, HoldStatus, NewHold};
use crate::services::metrics;
use crate::services::store::{HoldStore, StoreError};

const MAX_SWAP_ATTEMPTS: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct ExtendOutcome {
    pub success: bool,
    pub new_expires_at: DateTime<Utc>,
    pub hold: Hold,
}

#[derive(Clone)]
pub struct HoldLedger {
    store: Arc<dyn HoldStore>,
}

impl HoldLedger {
    pub fn new(store: Arc<dyn HoldStore>) -> Self {
        Self { store }
    }

    #[tracing::instrument(skip(self, params), fields(resource_id = %params.resource_id))]
    pub async fn create(&self, params: NewHold, now: DateTime<Utc>) -> Result<Hold, AccessError> {
        if params.ttl <= Duration::zero() {
            return Err(AccessError::validation("hold ttl must be positive"));
        }
        if params.resource_id.trim().is_empty() {
            return Err(AccessError::validation("resource id is required"));
        }

        let hold = Hold::new(params, now);
        match self.store.insert_exclusive(&hold).await {
            Ok(()) => {
                metrics::record_hold_transition(&HoldStatus::Active.to_string());
                tracing::info!(
                    hold_id = %hold.hold_id,
                    expires_at = %hold.expires_at,
                    "Hold created"
                );
                Ok(hold)
            }
            Err(StoreError::ResourceHeld(resource)) => Err(AccessError::ResourceBusy(format!(
                "resource {} already has a live hold",
                resource
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, hold_id: &str) -> Result<Hold, AccessError> {
        self.store
            .get_hold(hold_id)
            .await?
            .ok_or_else(|| AccessError::not_found(format!("hold {}", hold_id)))
    }

    pub async fn live_hold_for(&self, resource_id: &str) -> Result<Option<Hold>, AccessError> {
        Ok(self.store.live_hold_for_resource(resource_id).await?)
    }

    #[tracing::instrument(skip(self))]
    pub async fn extend(
        &self,
        hold_id: &str,
        minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<ExtendOutcome, AccessError> {
        if minutes <= 0 {
            return Err(AccessError::validation("extension minutes must be positive"));
        }

        let hold = self
            .transition(hold_id, |current| {
                if !current.is_live() {
                    return Err(AccessError::invalid_state(format!(
                        "hold {} is {}",
                        current.hold_id, current.status
                    )));
                }
                if current.is_lapsed(now) {
                    return Err(AccessError::invalid_state(format!(
                        "hold {} lapsed at {}",
                        current.hold_id, current.expires_at
                    )));
                }
                Ok(Some(current.extended(Duration::minutes(minutes))))
            })
            .await?
            .ok_or_else(|| AccessError::invalid_state(format!("hold {} not extended", hold_id)))?;

        metrics::record_hold_transition(&HoldStatus::Extended.to_string());
        tracing::info!(
            hold_id = %hold.hold_id,
            expires_at = %hold.expires_at,
            extension_count = hold.extension_count,
            "Hold extended"
        );

        Ok(ExtendOutcome {
            success: true,
            new_expires_at: hold.expires_at,
            hold,
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn revoke(
        &self,
        hold_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Hold, AccessError> {
        let hold = self
            .transition(hold_id, |current| {
                if current.status.is_terminal() {
                    return Err(AccessError::invalid_state(format!(
                        "hold {} is already {}",
                        current.hold_id, current.status
                    )));
                }
                Ok(Some(current.revoked(reason, now)))
            })
            .await?
            .ok_or_else(|| AccessError::invalid_state(format!("hold {} not revoked", hold_id)))?;

        metrics::record_hold_transition(&HoldStatus::Revoked.to_string());
        tracing::info!(hold_id = %hold.hold_id, reason = %reason, "Hold revoked");
        Ok(hold)
    }

    /// Flag a hold that is about to lapse. Returns the hold only when this
    /// call made the change.
    pub async fn mark_expiring(
        &self,
        hold_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Hold>, AccessError> {
        let hold = self
            .transition(hold_id, |current| match current.status {
                HoldStatus::Active | HoldStatus::Extended if !current.is_lapsed(now) => {
                    Ok(Some(current.expiring()))
                }
                _ => Ok(None),
            })
            .await?;

        if let Some(hold) = &hold {
            metrics::record_hold_transition(&HoldStatus::Expiring.to_string());
            tracing::debug!(hold_id = %hold.hold_id, "Hold marked expiring");
        }
        Ok(hold)
    }

    /// Live holds that have reached their expiry.
    pub async fn due_holds(&self, now: DateTime<Utc>) -> Result<Vec<Hold>, AccessError> {
        Ok(self.store.live_holds_expiring_by(now).await?)
    }

    /// Active or extended holds lapsing within `window`, not yet warned about.
    pub async fn expiring_within(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<Hold>, AccessError> {
        let until = now.checked_add_signed(window).ok_or_else(|| {
            AccessError::validation(format!("{} plus the warning window is out of range", now))
        })?;
        Ok(self
            .store
            .live_holds_expiring_by(until)
            .await?
            .into_iter()
            .filter(|h| {
                matches!(h.status, HoldStatus::Active | HoldStatus::Extended) && !h.is_lapsed(now)
            })
            .collect())
    }

    /// Expire the hold if it is still due when the write commits.
    pub async fn expire_if_due(
        &self,
        hold_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Hold>, AccessError> {
        let hold = self
            .transition(hold_id, |current| {
                if current.is_due(now) {
                    Ok(Some(current.expired(now)))
                } else {
                    Ok(None)
                }
            })
            .await?;

        if let Some(hold) = &hold {
            metrics::record_hold_transition(&HoldStatus::Expired.to_string());
            tracing::info!(
                hold_id = %hold.hold_id,
                resource_id = %hold.resource_id,
                "Hold expired"
            );
        }
        Ok(hold)
    }

    /// Expire every due hold. Holds changed since selection are re-checked
    /// and skipped when no longer due.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<Hold>, AccessError> {
        let mut expired = Vec::new();
        for candidate in self.due_holds(now).await? {
            if let Some(hold) = self.expire_if_due(&candidate.hold_id, now).await? {
                expired.push(hold);
            }
        }
        Ok(expired)
    }

    /// Read, decide, compare-and-swap, retrying on stale writes.
    ///
    /// `decide` returns `Ok(None)` when no change applies to what it saw.
    async fn transition<F>(&self, hold_id: &str, mut decide: F) -> Result<Option<Hold>, AccessError>
    where
        F: FnMut(&Hold) -> Result<Option<Hold>, AccessError> + Send,
    {
        for attempt in 1..=MAX_SWAP_ATTEMPTS {
            let current = self.get(hold_id).await?;
            let Some(next) = decide(&current)? else {
                return Ok(None);
            };

            if self.store.swap_hold(current.version, &next).await? {
                return Ok(Some(next));
            }

            tracing::debug!(hold_id = %hold_id, attempt, "Stale hold write, re-reading");
        }

        Err(AccessError::invalid_state(format!(
            "hold {} changed concurrently {} times",
            hold_id, MAX_SWAP_ATTEMPTS
        )))
    }
}
