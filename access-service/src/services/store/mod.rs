//! Persistence seams for holds, requests, the audit trail and the delivery log.
//!
//! Every mutation of a hold or request goes through a versioned swap, which
//! only writes when the stored version still matches the one the caller read.
//! Callers retry on a stale write after re-reading, which serializes updates per
//! entity while different entities proceed independently.

pub mod memory;
pub mod mongo;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{AccessRequest, AuditRecord, Channel, Hold};

pub use memory::MemoryStore;
pub use mongo::AccessDb;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Resource already held: {0}")]
    ResourceHeld(String),

    #[error("Duplicate key: {0}")]
    Duplicate(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait HoldStore: Send + Sync {
    /// Insert `hold` unless a live hold already occupies its resource.
    async fn insert_exclusive(&self, hold: &Hold) -> Result<(), StoreError>;

    async fn get_hold(&self, hold_id: &str) -> Result<Option<Hold>, StoreError>;

    async fn live_hold_for_resource(&self, resource_id: &str)
        -> Result<Option<Hold>, StoreError>;

    /// Replace the stored hold when its version is still `expected_version`.
    /// Returns `false` on a stale write.
    async fn swap_hold(&self, expected_version: i64, next: &Hold) -> Result<bool, StoreError>;

    /// Live holds whose expiry is at or before `cutoff`, earliest first.
    async fn live_holds_expiring_by(&self, cutoff: DateTime<Utc>)
        -> Result<Vec<Hold>, StoreError>;
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn insert_request(&self, request: &AccessRequest) -> Result<(), StoreError>;

    async fn get_request(&self, request_id: &str) -> Result<Option<AccessRequest>, StoreError>;

    async fn swap_request(
        &self,
        expected_version: i64,
        next: &AccessRequest,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> Result<(), StoreError>;

    async fn records_for_request(&self, request_id: &str)
        -> Result<Vec<AuditRecord>, StoreError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    InFlight,
    Delivered,
    Failed,
}

/// Identity of one delivery: an event, on one channel, to one address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryKey {
    pub event_id: String,
    pub channel: Channel,
    pub recipient: String,
}

impl DeliveryKey {
    pub fn new(event_id: &str, channel: Channel, recipient: &str) -> Self {
        Self {
            event_id: event_id.to_string(),
            channel,
            recipient: recipient.to_string(),
        }
    }

    pub fn id(&self) -> String {
        format!("{}:{}:{}", self.event_id, self.channel, self.recipient)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub event_id: String,
    pub channel: Channel,
    pub recipient: String,
    pub state: DeliveryState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(with = "crate::models::datetime::chrono_as_bson")]
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn in_flight(key: &DeliveryKey) -> Self {
        Self {
            id: key.id(),
            event_id: key.event_id.clone(),
            channel: key.channel,
            recipient: key.recipient.clone(),
            state: DeliveryState::InFlight,
            attempts: 1,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Result of trying to take ownership of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller owns this attempt (1-based).
    Acquired { attempt: u32 },
    AlreadyDelivered,
    InFlight,
}

#[async_trait]
pub trait DeliveryLog: Send + Sync {
    /// Atomically move the key to in-flight when it is new, previously
    /// failed, or in flight with a claim last touched before `stale_before`
    /// (an attempt that was abandoned mid-delivery).
    async fn claim(
        &self,
        key: &DeliveryKey,
        stale_before: DateTime<Utc>,
    ) -> Result<Claim, StoreError>;

    async fn complete(
        &self,
        key: &DeliveryKey,
        state: DeliveryState,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    async fn delivery(&self, key: &DeliveryKey) -> Result<Option<DeliveryRecord>, StoreError>;
}
