//! Notification fan-out.
//!
//! An event names an audience and a set of channels. The dispatcher resolves
//! the audience to people through the directory, each person to concrete
//! addresses, and delivers to every address in parallel. Each
//! (event, channel, address) triple is claimed in the delivery log before the
//! transport is called, so a re-sent event never reaches anyone twice.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;
use validator::Validate;

use crate::config::DispatchConfig;
use crate::error::AccessError;
use crate::models::{Channel, EventKind, NotificationEvent, Payload, Recipient, Target};
use crate::services::directory::Directory;
use crate::services::metrics;
use crate::services::store::{Claim, DeliveryKey, DeliveryLog, DeliveryState};
use crate::services::transports::{Transport, TransportError};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeliveryFailure {
    pub channel: Channel,
    pub recipient: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct DispatchReport {
    pub delivered: usize,
    /// Already delivered or currently being delivered by someone else.
    pub skipped: usize,
    /// Users with no address on a requested channel.
    pub unreachable: Vec<String>,
    pub failed: Vec<DeliveryFailure>,
}

impl DispatchReport {
    fn record(&mut self, attempt: Attempt) {
        match attempt {
            Attempt::Delivered => self.delivered += 1,
            Attempt::Skipped => self.skipped += 1,
            Attempt::Failed(failure) => self.failed.push(failure),
        }
    }
}

/// One entry of a batch send.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BatchEntry {
    pub kind: EventKind,
    pub target: Target,
    #[validate(nested)]
    pub payload: BatchPayload,
    #[serde(default)]
    pub channels: BTreeSet<Channel>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BatchPayload {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(length(max = 2000))]
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub data: std::collections::BTreeMap<String, String>,
}

impl From<BatchPayload> for Payload {
    fn from(p: BatchPayload) -> Self {
        Payload {
            title: p.title,
            body: p.body,
            data: p.data,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchFailure {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub delivered: usize,
    pub failures: Vec<BatchFailure>,
}

/// The result of a committed change whose notifications are still on
/// their way. The deliveries run on their own tasks; dropping this value
/// leaves them running.
#[derive(Debug)]
pub struct Notified<T> {
    pub value: T,
    pub deliveries: Vec<JoinHandle<()>>,
}

impl<T> Notified<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            deliveries: Vec::new(),
        }
    }

    pub fn with(mut self, delivery: JoinHandle<()>) -> Self {
        self.deliveries.push(delivery);
        self
    }

    /// Wait for every delivery to finish.
    pub async fn settle(self) -> T {
        for result in join_all(self.deliveries).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Notification task failed");
            }
        }
        self.value
    }

    /// Wait for the deliveries until `deadline`, then hand back the value
    /// and let any stragglers finish in the background.
    pub async fn settle_by(self, deadline: tokio::time::Instant) -> T {
        let pending = self.deliveries.len();
        if tokio::time::timeout_at(deadline, join_all(self.deliveries))
            .await
            .is_err()
        {
            tracing::debug!(pending, "Notifications still in progress, continuing in background");
        }
        self.value
    }
}

/// A failed delivery waiting for another attempt.
#[derive(Debug, Clone)]
struct PendingRetry {
    key: DeliveryKey,
    recipient: Recipient,
    payload: Payload,
}

enum Attempt {
    Delivered,
    Skipped,
    Failed(DeliveryFailure),
}

pub struct NotificationDispatcher {
    directory: Arc<dyn Directory>,
    log: Arc<dyn DeliveryLog>,
    transports: HashMap<Channel, Arc<dyn Transport>>,
    config: DispatchConfig,
    retries: Mutex<VecDeque<PendingRetry>>,
}

impl NotificationDispatcher {
    pub fn new(
        directory: Arc<dyn Directory>,
        log: Arc<dyn DeliveryLog>,
        transports: Vec<Arc<dyn Transport>>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            directory,
            log,
            transports: transports.into_iter().map(|t| (t.channel(), t)).collect(),
            config,
            retries: Mutex::new(VecDeque::new()),
        }
    }

    /// Deliveries currently waiting for a retry.
    pub fn pending_retries(&self) -> usize {
        self.retries.lock().map(|q| q.len()).unwrap_or_default()
    }

    /// Send on a task of its own, so the delivery finishes even when the
    /// caller stops waiting for it.
    pub fn notify_detached(self: &Arc<Self>, event: NotificationEvent) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move { dispatcher.notify(event).await }.in_current_span())
    }

    /// Send, logging instead of returning errors. Used for lifecycle events
    /// whose state change is already committed.
    pub async fn notify(&self, event: NotificationEvent) {
        let event_id = event.event_id.clone();
        let kind = event.kind;
        match self.send(event).await {
            Ok(report) if !report.failed.is_empty() => tracing::warn!(
                event_id = %event_id,
                kind = %kind,
                failed = report.failed.len(),
                delivered = report.delivered,
                "Some notifications failed and were queued for retry"
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!(
                event_id = %event_id,
                kind = %kind,
                error = %e,
                "Notification dispatch failed"
            ),
        }
    }

    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id, kind = %event.kind))]
    pub async fn send(&self, event: NotificationEvent) -> Result<DispatchReport, AccessError> {
        if event.payload.title.trim().is_empty() {
            return Err(AccessError::validation("notification title is required"));
        }

        let users = self.resolve_target(&event.target)?;
        let mut report = DispatchReport::default();
        let mut deliveries: Vec<(DeliveryKey, Recipient)> = Vec::new();
        let mut seen = BTreeSet::new();

        for user_id in &users {
            let contact = self.directory.contact(user_id);
            for channel in &event.channels {
                let recipients = contact
                    .as_ref()
                    .map(|c| c.recipients(*channel))
                    .unwrap_or_default();
                if recipients.is_empty() {
                    report.unreachable.push(format!("{}:{}", user_id, channel));
                    continue;
                }
                for recipient in recipients {
                    let key = DeliveryKey::new(&event.event_id, *channel, recipient.address());
                    if seen.insert(key.id()) {
                        deliveries.push((key, recipient));
                    }
                }
            }
        }

        let attempts = deliveries
            .into_iter()
            .map(|(key, recipient)| self.attempt(key, recipient, event.payload.clone()));
        for outcome in join_all(attempts).await {
            report.record(outcome);
        }

        tracing::info!(
            users = users.len(),
            delivered = report.delivered,
            skipped = report.skipped,
            failed = report.failed.len(),
            "Notification dispatched"
        );

        Ok(report)
    }

    /// Dispatch each entry on its own; one bad entry never stops the rest.
    pub async fn batch_send(&self, entries: Vec<BatchEntry>) -> BatchReport {
        let total = entries.len();
        let sends = entries.into_iter().enumerate().map(|(index, entry)| async move {
            let result = match entry.validate() {
                Ok(()) => {
                    let event = NotificationEvent::new(
                        entry.kind,
                        entry.target,
                        entry.payload.into(),
                        entry.channels,
                    );
                    self.send(event).await
                }
                Err(e) => Err(AccessError::validation(e.to_string())),
            };
            (index, result)
        });

        let mut report = BatchReport {
            total,
            ..BatchReport::default()
        };
        for (index, result) in join_all(sends).await {
            match result {
                Ok(dispatch) if dispatch.delivered == 0 && !dispatch.failed.is_empty() => {
                    report.failures.push(BatchFailure {
                        index,
                        error: dispatch.failed[0].error.clone(),
                    });
                }
                Ok(dispatch) => {
                    report.succeeded += 1;
                    report.delivered += dispatch.delivered;
                }
                Err(e) => report.failures.push(BatchFailure {
                    index,
                    error: e.to_string(),
                }),
            }
        }

        tracing::info!(
            total,
            succeeded = report.succeeded,
            failures = report.failures.len(),
            "Batch dispatched"
        );
        report
    }

    /// Re-attempt every queued failure once.
    pub async fn retry_failed(&self) -> DispatchReport {
        let pending: Vec<PendingRetry> = match self.retries.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(e) => {
                tracing::error!(error = %e, "Retry queue mutex poisoned");
                return DispatchReport::default();
            }
        };
        if pending.is_empty() {
            return DispatchReport::default();
        }

        tracing::debug!(count = pending.len(), "Retrying failed deliveries");

        let mut report = DispatchReport::default();
        let attempts = pending
            .into_iter()
            .map(|p| self.attempt(p.key, p.recipient, p.payload));
        for outcome in join_all(attempts).await {
            report.record(outcome);
        }
        report
    }

    /// Run [`retry_failed`](Self::retry_failed) on an interval until shutdown.
    pub fn spawn_retry_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = std::time::Duration::from_secs(self.config.retry_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.retry_failed().await;
                        if report.delivered > 0 || !report.failed.is_empty() {
                            tracing::info!(
                                delivered = report.delivered,
                                failed = report.failed.len(),
                                "Retry pass finished"
                            );
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Notification retry worker stopped");
        })
    }

    /// In-flight claims last touched before this instant belong to attempts
    /// that never finished and may be taken over.
    fn stale_claim_cutoff(&self) -> DateTime<Utc> {
        let lease = chrono::Duration::from_std(self.config.claim_lease())
            .unwrap_or_else(|_| chrono::Duration::days(1));
        Utc::now()
            .checked_sub_signed(lease)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn resolve_target(&self, target: &Target) -> Result<Vec<String>, AccessError> {
        let users = match target {
            Target::User { user_id } => vec![user_id.clone()],
            Target::Users { user_ids } => user_ids.clone(),
            Target::Site { site_id } => {
                if self.directory.site(site_id).is_none() {
                    return Err(AccessError::validation(format!("unknown site {}", site_id)));
                }
                self.directory.members(site_id)
            }
            Target::Role { site_id, role } => {
                if self.directory.site(site_id).is_none() {
                    return Err(AccessError::validation(format!("unknown site {}", site_id)));
                }
                self.directory.role_members(site_id, *role)
            }
        };

        let mut seen = BTreeSet::new();
        let users: Vec<String> = users
            .into_iter()
            .filter(|u| !u.trim().is_empty() && seen.insert(u.clone()))
            .collect();

        if users.is_empty() && matches!(target, Target::User { .. } | Target::Users { .. }) {
            return Err(AccessError::validation("notification target names no users"));
        }
        Ok(users)
    }

    async fn attempt(&self, key: DeliveryKey, recipient: Recipient, payload: Payload) -> Attempt {
        let attempt = match self.log.claim(&key, self.stale_claim_cutoff()).await {
            Ok(Claim::Acquired { attempt }) => attempt,
            Ok(Claim::AlreadyDelivered) | Ok(Claim::InFlight) => return Attempt::Skipped,
            Err(e) => {
                return Attempt::Failed(DeliveryFailure {
                    channel: key.channel,
                    recipient: key.recipient.clone(),
                    error: format!("delivery log unavailable: {}", e),
                })
            }
        };

        let result = match self.transports.get(&key.channel) {
            Some(transport) => {
                let timeout = self.config.delivery_timeout();
                match tokio::time::timeout(timeout, transport.deliver(&recipient, &payload)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout(self.config.delivery_timeout_ms)),
                }
            }
            None => Err(TransportError::NotEnabled(format!(
                "no transport configured for {}",
                key.channel
            ))),
        };

        let channel = key.channel.to_string();
        match result {
            Ok(receipt) => {
                metrics::record_delivery(&channel, "delivered");
                tracing::debug!(
                    delivery = %key.id(),
                    attempt,
                    provider_id = receipt.provider_id.as_deref().unwrap_or(""),
                    "Delivered"
                );
                if let Err(e) = self.log.complete(&key, DeliveryState::Delivered, None).await {
                    tracing::warn!(delivery = %key.id(), error = %e, "Failed to record delivery");
                }
                Attempt::Delivered
            }
            Err(error) => {
                metrics::record_delivery(&channel, "failed");
                if let Err(e) = self
                    .log
                    .complete(&key, DeliveryState::Failed, Some(error.to_string()))
                    .await
                {
                    tracing::warn!(delivery = %key.id(), error = %e, "Failed to record delivery failure");
                }

                let failure = DeliveryFailure {
                    channel: key.channel,
                    recipient: key.recipient.clone(),
                    error: error.to_string(),
                };

                if !error.is_retryable() {
                    tracing::warn!(
                        delivery = %key.id(),
                        error = %error,
                        "Delivery failed permanently"
                    );
                } else if attempt >= self.config.max_attempts {
                    metrics::record_retry_exhausted(&channel);
                    tracing::error!(
                        delivery = %key.id(),
                        attempts = attempt,
                        error = %error,
                        "Delivery abandoned after exhausting retries"
                    );
                } else {
                    tracing::debug!(delivery = %key.id(), attempt, "Queued delivery for retry");
                    if let Ok(mut queue) = self.retries.lock() {
                        queue.push_back(PendingRetry {
                            key,
                            recipient,
                            payload,
                        });
                    }
                }

                Attempt::Failed(failure)
            }
        }
    }
}
