use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SweepConfig;
use crate::error::AccessError;
use crate::models::{AuditAction, EventKind, Hold, NotificationEvent, RequestStatus, Target};
use crate::services::dispatcher::{Notified, NotificationDispatcher};
use crate::services::hold_ledger::HoldLedger;
use crate::services::request_machine::AccessRequestMachine;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SweepReport {
    /// Holds this sweep moved to `expired`.
    pub expired: Vec<String>,
    /// Holds this sweep moved to `expiring`.
    pub warned: Vec<String>,
    pub errors: usize,
}

/// Expires lapsed holds and warns about ones about to lapse.
///
/// A sweep is safe to repeat for the same instant: each hold transitions at
/// most once, so each expiry notifies at most once.
pub struct ExpirySweeper {
    ledger: HoldLedger,
    machine: Arc<AccessRequestMachine>,
    dispatcher: Arc<NotificationDispatcher>,
    config: SweepConfig,
}

impl ExpirySweeper {
    pub fn new(
        ledger: HoldLedger,
        machine: Arc<AccessRequestMachine>,
        dispatcher: Arc<NotificationDispatcher>,
        config: SweepConfig,
    ) -> Self {
        Self {
            ledger,
            machine,
            dispatcher,
            config,
        }
    }

    /// Expire every due hold and wait for the expiry notifications.
    pub async fn run_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, AccessError> {
        Ok(self.start_sweep(now).await?.settle().await)
    }

    /// Expire every due hold. The notifications are handed back still in
    /// flight.
    #[tracing::instrument(skip(self))]
    pub async fn start_sweep(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Notified<SweepReport>, AccessError> {
        let (_tx, rx) = watch::channel(false);
        self.expire_due(now, &rx).await
    }

    /// Move active and extended holds inside the warning window to
    /// `expiring`, notifying each holder once.
    pub async fn warn_expiring(&self, now: DateTime<Utc>) -> Result<SweepReport, AccessError> {
        Ok(self.start_warnings(now).await?.settle().await)
    }

    #[tracing::instrument(skip(self))]
    pub async fn start_warnings(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Notified<SweepReport>, AccessError> {
        let window = Duration::minutes(self.config.expiring_soon_minutes);
        let mut swept = Notified::new(SweepReport::default());

        for candidate in self.ledger.expiring_within(now, window).await? {
            match self.ledger.mark_expiring(&candidate.hold_id, now).await {
                Ok(Some(hold)) => {
                    let event =
                        NotificationEvent::for_hold(EventKind::ExpiringSoon, &hold, holder(&hold));
                    swept = swept.with(self.dispatcher.notify_detached(event));
                    swept.value.warned.push(hold.hold_id);
                }
                Ok(None) => {}
                Err(e) => {
                    swept.value.errors += 1;
                    tracing::warn!(hold_id = %candidate.hold_id, error = %e, "Failed to mark hold expiring");
                }
            }
        }

        Ok(swept)
    }

    /// Expire one hold if it is due, with the same follow-up as a full sweep.
    /// Returns the expired hold when this call expired it.
    pub async fn sweep_hold(
        &self,
        hold_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Notified<Hold>>, AccessError> {
        let Some(hold) = self.ledger.expire_if_due(hold_id, now).await? else {
            return Ok(None);
        };
        let delivery = self.after_expiry(&hold, now).await;
        Ok(Some(Notified::new(hold).with(delivery)))
    }

    /// Periodic sweeps until `shutdown` flips to true. The hold being
    /// processed when shutdown arrives is finished first.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = std::time::Duration::from_secs(self.config.interval_secs.max(1));
            let mut ticker = tokio::time::interval(period);
            tracing::info!(interval_secs = period.as_secs(), "Expiry sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        match self.expire_due(now, &shutdown).await {
                            Ok(swept) => {
                                let report = swept.settle().await;
                                if !report.expired.is_empty() {
                                    tracing::info!(expired = report.expired.len(), "Sweep expired holds");
                                }
                            }
                            Err(e) => tracing::error!(error = %e, "Sweep failed"),
                        }
                        if *shutdown.borrow() {
                            break;
                        }
                        if let Err(e) = self.warn_expiring(now).await {
                            tracing::error!(error = %e, "Expiring-soon pass failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Expiry sweeper stopped");
        })
    }

    async fn expire_due(
        &self,
        now: DateTime<Utc>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Notified<SweepReport>, AccessError> {
        let mut swept = Notified::new(SweepReport::default());

        for candidate in self.ledger.due_holds(now).await? {
            if *shutdown.borrow() {
                tracing::info!("Shutdown requested, stopping sweep early");
                break;
            }
            match self.sweep_hold(&candidate.hold_id, now).await {
                Ok(Some(expired)) => {
                    swept.value.expired.push(expired.value.hold_id);
                    swept.deliveries.extend(expired.deliveries);
                }
                Ok(None) => {
                    tracing::debug!(hold_id = %candidate.hold_id, "Hold changed since selection, skipped");
                }
                Err(e) => {
                    swept.value.errors += 1;
                    tracing::warn!(hold_id = %candidate.hold_id, error = %e, "Failed to expire hold");
                }
            }
        }

        Ok(swept)
    }

    async fn after_expiry(&self, hold: &Hold, now: DateTime<Utc>) -> JoinHandle<()> {
        if let Err(e) = self
            .machine
            .close(&hold.request_id, RequestStatus::Expired, now)
            .await
        {
            tracing::warn!(
                hold_id = %hold.hold_id,
                request_id = %hold.request_id,
                error = %e,
                "Failed to close request for expired hold"
            );
        }
        self.machine
            .log_event(&hold.request_id, AuditAction::Expired, None)
            .await;
        self.dispatcher.notify_detached(NotificationEvent::for_hold(
            EventKind::Expired,
            hold,
            holder(hold),
        ))
    }
}

fn holder(hold: &Hold) -> Target {
    Target::User {
        user_id: hold.user_id.clone(),
    }
}
