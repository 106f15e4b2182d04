use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{
    AuditStore, Claim, DeliveryKey, DeliveryLog, DeliveryRecord, DeliveryState, HoldStore,
    RequestStore, StoreError,
};
use crate::models::{AccessRequest, AuditRecord, Hold};

#[derive(Default)]
struct HoldTable {
    holds: HashMap<String, Hold>,
    /// resource id -> id of the live hold occupying it
    live_by_resource: HashMap<String, String>,
}

/// Process-local store for tests and single-node development.
///
/// Hold writes take one mutex so the exclusivity check and the insert happen
/// together; critical sections never await.
#[derive(Default)]
pub struct MemoryStore {
    holds: Mutex<HoldTable>,
    requests: Mutex<HashMap<String, AccessRequest>>,
    audit: Mutex<Vec<AuditRecord>>,
    deliveries: DashMap<String, DeliveryRecord>,
    fail_audit: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every audit append fail, for exercising best-effort audit paths.
    pub fn set_audit_failure(&self, fail: bool) {
        self.fail_audit.store(fail, Ordering::SeqCst);
    }

    pub fn all_holds(&self) -> Result<Vec<Hold>, StoreError> {
        Ok(self.lock_holds()?.holds.values().cloned().collect())
    }

    fn lock_holds(&self) -> Result<std::sync::MutexGuard<'_, HoldTable>, StoreError> {
        self.holds
            .lock()
            .map_err(|e| StoreError::Backend(format!("Hold table mutex poisoned: {}", e)))
    }

    fn lock_requests(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, AccessRequest>>, StoreError> {
        self.requests
            .lock()
            .map_err(|e| StoreError::Backend(format!("Request table mutex poisoned: {}", e)))
    }
}

#[async_trait]
impl HoldStore for MemoryStore {
    async fn insert_exclusive(&self, hold: &Hold) -> Result<(), StoreError> {
        let mut table = self.lock_holds()?;

        if table.holds.contains_key(&hold.hold_id) {
            return Err(StoreError::Duplicate(hold.hold_id.clone()));
        }

        if hold.live {
            if let Some(existing) = table.live_by_resource.get(&hold.resource_id) {
                return Err(StoreError::ResourceHeld(format!(
                    "{} is held by {}",
                    hold.resource_id, existing
                )));
            }
            table
                .live_by_resource
                .insert(hold.resource_id.clone(), hold.hold_id.clone());
        }

        table.holds.insert(hold.hold_id.clone(), hold.clone());
        Ok(())
    }

    async fn get_hold(&self, hold_id: &str) -> Result<Option<Hold>, StoreError> {
        Ok(self.lock_holds()?.holds.get(hold_id).cloned())
    }

    async fn live_hold_for_resource(
        &self,
        resource_id: &str,
    ) -> Result<Option<Hold>, StoreError> {
        let table = self.lock_holds()?;
        Ok(table
            .live_by_resource
            .get(resource_id)
            .and_then(|hold_id| table.holds.get(hold_id))
            .cloned())
    }

    async fn swap_hold(&self, expected_version: i64, next: &Hold) -> Result<bool, StoreError> {
        let mut table = self.lock_holds()?;

        let current_version = match table.holds.get(&next.hold_id) {
            Some(current) => current.version,
            None => return Ok(false),
        };
        if current_version != expected_version {
            return Ok(false);
        }

        if !next.live {
            let occupies = table
                .live_by_resource
                .get(&next.resource_id)
                .is_some_and(|id| id == &next.hold_id);
            if occupies {
                table.live_by_resource.remove(&next.resource_id);
            }
        }
        table.holds.insert(next.hold_id.clone(), next.clone());
        Ok(true)
    }

    async fn live_holds_expiring_by(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Hold>, StoreError> {
        let table = self.lock_holds()?;
        let mut due: Vec<Hold> = table
            .holds
            .values()
            .filter(|h| h.live && h.expires_at <= cutoff)
            .cloned()
            .collect();
        due.sort_by_key(|h| h.expires_at);
        Ok(due)
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn insert_request(&self, request: &AccessRequest) -> Result<(), StoreError> {
        let mut requests = self.lock_requests()?;
        if requests.contains_key(&request.request_id) {
            return Err(StoreError::Duplicate(request.request_id.clone()));
        }
        requests.insert(request.request_id.clone(), request.clone());
        Ok(())
    }

    async fn get_request(&self, request_id: &str) -> Result<Option<AccessRequest>, StoreError> {
        Ok(self.lock_requests()?.get(request_id).cloned())
    }

    async fn swap_request(
        &self,
        expected_version: i64,
        next: &AccessRequest,
    ) -> Result<bool, StoreError> {
        let mut requests = self.lock_requests()?;
        match requests.get_mut(&next.request_id) {
            Some(current) if current.version == expected_version => {
                *current = next.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append(&self, record: &AuditRecord) -> Result<(), StoreError> {
        if self.fail_audit.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("audit log unavailable".to_string()));
        }
        self.audit
            .lock()
            .map_err(|e| StoreError::Backend(format!("Audit log mutex poisoned: {}", e)))?
            .push(record.clone());
        Ok(())
    }

    async fn records_for_request(
        &self,
        request_id: &str,
    ) -> Result<Vec<AuditRecord>, StoreError> {
        Ok(self
            .audit
            .lock()
            .map_err(|e| StoreError::Backend(format!("Audit log mutex poisoned: {}", e)))?
            .iter()
            .filter(|r| r.request_id == request_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DeliveryLog for MemoryStore {
    async fn claim(
        &self,
        key: &DeliveryKey,
        stale_before: DateTime<Utc>,
    ) -> Result<Claim, StoreError> {
        match self.deliveries.entry(key.id()) {
            Entry::Vacant(slot) => {
                slot.insert(DeliveryRecord::in_flight(key));
                Ok(Claim::Acquired { attempt: 1 })
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                match record.state {
                    DeliveryState::Delivered => Ok(Claim::AlreadyDelivered),
                    DeliveryState::InFlight if record.updated_at >= stale_before => {
                        Ok(Claim::InFlight)
                    }
                    DeliveryState::InFlight | DeliveryState::Failed => {
                        record.state = DeliveryState::InFlight;
                        record.attempts += 1;
                        record.updated_at = Utc::now();
                        Ok(Claim::Acquired {
                            attempt: record.attempts,
                        })
                    }
                }
            }
        }
    }

    async fn complete(
        &self,
        key: &DeliveryKey,
        state: DeliveryState,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        match self.deliveries.get_mut(&key.id()) {
            Some(mut record) => {
                record.state = state;
                record.last_error = error;
                record.updated_at = Utc::now();
                Ok(())
            }
            None => Err(StoreError::Backend(format!(
                "No delivery claim for {}",
                key.id()
            ))),
        }
    }

    async fn delivery(&self, key: &DeliveryKey) -> Result<Option<DeliveryRecord>, StoreError> {
        Ok(self.deliveries.get(&key.id()).map(|r| r.clone()))
    }
}
