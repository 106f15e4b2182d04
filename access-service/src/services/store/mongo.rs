use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, DateTime as BsonDateTime},
    error::{ErrorKind, WriteFailure},
    options::{FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument},
    Client as MongoClient, Collection, Database, IndexModel,
};
use service_core::error::AppError;

use super::{
    AuditStore, Claim, DeliveryKey, DeliveryLog, DeliveryRecord, DeliveryState, HoldStore,
    RequestStore, StoreError,
};
use crate::models::{AccessRequest, AuditRecord, Hold};

const DUPLICATE_KEY: i32 = 11000;

#[derive(Clone)]
pub struct AccessDb {
    client: MongoClient,
    db: Database,
}

fn backend(context: &str, e: mongodb::error::Error) -> StoreError {
    tracing::error!("{}: {}", context, e);
    StoreError::Backend(format!("{}: {}", context, e))
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    matches!(
        e.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == DUPLICATE_KEY
    )
}

impl AccessDb {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, AppError> {
        tracing::info!("Connecting to MongoDB");
        let client = MongoClient::with_uri_str(uri).await.map_err(|e| {
            tracing::error!("Failed to connect to MongoDB: {}", e);
            AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
        })?;
        let db = client.database(database);
        tracing::info!(database = %database, "Successfully connected to MongoDB database");
        Ok(Self { client, db })
    }

    pub async fn initialize_indexes(&self) -> Result<(), AppError> {
        tracing::info!("Creating MongoDB indexes for access-service");

        // At most one live hold per resource
        let live_resource_index = IndexModel::builder()
            .keys(doc! { "resource_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("live_resource_unique_idx".to_string())
                    .unique(true)
                    .partial_filter_expression(doc! { "live": true })
                    .build(),
            )
            .build();

        let sweep_index = IndexModel::builder()
            .keys(doc! { "live": 1, "expires_at": 1 })
            .options(
                IndexOptions::builder()
                    .name("live_expires_at_idx".to_string())
                    .build(),
            )
            .build();

        self.holds()
            .create_indexes(vec![live_resource_index, sweep_index], None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create hold indexes: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;

        let requester_index = IndexModel::builder()
            .keys(doc! { "user_id": 1, "created_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("user_created_idx".to_string())
                    .build(),
            )
            .build();

        self.requests()
            .create_index(requester_index, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create request index: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;

        let audit_index = IndexModel::builder()
            .keys(doc! { "request_id": 1, "recorded_at": 1 })
            .options(
                IndexOptions::builder()
                    .name("request_recorded_idx".to_string())
                    .build(),
            )
            .build();

        self.audit_log()
            .create_index(audit_index, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create audit index: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;

        tracing::info!("Successfully created all MongoDB indexes");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| {
                tracing::error!("MongoDB health check failed: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;
        Ok(())
    }

    fn holds(&self) -> Collection<Hold> {
        self.db.collection("holds")
    }

    fn requests(&self) -> Collection<AccessRequest> {
        self.db.collection("access_requests")
    }

    fn audit_log(&self) -> Collection<AuditRecord> {
        self.db.collection("audit_log")
    }

    fn deliveries(&self) -> Collection<DeliveryRecord> {
        self.db.collection("deliveries")
    }
}

#[async_trait]
impl HoldStore for AccessDb {
    async fn insert_exclusive(&self, hold: &Hold) -> Result<(), StoreError> {
        match self.holds().insert_one(hold, None).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => {
                // _id collisions are not realistic with v4 ids; the unique index is the live one.
                Err(StoreError::ResourceHeld(hold.resource_id.clone()))
            }
            Err(e) => Err(backend("Failed to insert hold", e)),
        }
    }

    async fn get_hold(&self, hold_id: &str) -> Result<Option<Hold>, StoreError> {
        self.holds()
            .find_one(doc! { "_id": hold_id }, None)
            .await
            .map_err(|e| backend("Failed to find hold", e))
    }

    async fn live_hold_for_resource(
        &self,
        resource_id: &str,
    ) -> Result<Option<Hold>, StoreError> {
        self.holds()
            .find_one(doc! { "resource_id": resource_id, "live": true }, None)
            .await
            .map_err(|e| backend("Failed to find live hold", e))
    }

    async fn swap_hold(&self, expected_version: i64, next: &Hold) -> Result<bool, StoreError> {
        let result = self
            .holds()
            .replace_one(
                doc! { "_id": next.hold_id.as_str(), "version": expected_version },
                next,
                None,
            )
            .await
            .map_err(|e| backend("Failed to update hold", e))?;
        Ok(result.matched_count == 1)
    }

    async fn live_holds_expiring_by(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Hold>, StoreError> {
        let options = FindOptions::builder()
            .sort(doc! { "expires_at": 1 })
            .build();
        let cursor = self
            .holds()
            .find(
                doc! {
                    "live": true,
                    "expires_at": { "$lte": BsonDateTime::from_chrono(cutoff) },
                },
                options,
            )
            .await
            .map_err(|e| backend("Failed to query due holds", e))?;

        cursor
            .try_collect()
            .await
            .map_err(|e| backend("Failed to collect due holds", e))
    }
}

#[async_trait]
impl RequestStore for AccessDb {
    async fn insert_request(&self, request: &AccessRequest) -> Result<(), StoreError> {
        match self.requests().insert_one(request, None).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => {
                Err(StoreError::Duplicate(request.request_id.clone()))
            }
            Err(e) => Err(backend("Failed to insert access request", e)),
        }
    }

    async fn get_request(&self, request_id: &str) -> Result<Option<AccessRequest>, StoreError> {
        self.requests()
            .find_one(doc! { "_id": request_id }, None)
            .await
            .map_err(|e| backend("Failed to find access request", e))
    }

    async fn swap_request(
        &self,
        expected_version: i64,
        next: &AccessRequest,
    ) -> Result<bool, StoreError> {
        let result = self
            .requests()
            .replace_one(
                doc! { "_id": next.request_id.as_str(), "version": expected_version },
                next,
                None,
            )
            .await
            .map_err(|e| backend("Failed to update access request", e))?;
        Ok(result.matched_count == 1)
    }
}

#[async_trait]
impl AuditStore for AccessDb {
    async fn append(&self, record: &AuditRecord) -> Result<(), StoreError> {
        self.audit_log()
            .insert_one(record, None)
            .await
            .map_err(|e| backend("Failed to append audit record", e))?;
        Ok(())
    }

    async fn records_for_request(
        &self,
        request_id: &str,
    ) -> Result<Vec<AuditRecord>, StoreError> {
        let options = FindOptions::builder()
            .sort(doc! { "recorded_at": 1 })
            .build();
        let cursor = self
            .audit_log()
            .find(doc! { "request_id": request_id }, options)
            .await
            .map_err(|e| backend("Failed to query audit log", e))?;
        cursor
            .try_collect()
            .await
            .map_err(|e| backend("Failed to collect audit log", e))
    }
}

#[async_trait]
impl DeliveryLog for AccessDb {
    async fn claim(
        &self,
        key: &DeliveryKey,
        stale_before: DateTime<Utc>,
    ) -> Result<Claim, StoreError> {
        match self
            .deliveries()
            .insert_one(DeliveryRecord::in_flight(key), None)
            .await
        {
            Ok(_) => return Ok(Claim::Acquired { attempt: 1 }),
            Err(e) if is_duplicate_key(&e) => {}
            Err(e) => return Err(backend("Failed to claim delivery", e)),
        }

        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let reclaimed = self
            .deliveries()
            .find_one_and_update(
                doc! {
                    "_id": key.id(),
                    "$or": [
                        { "state": "failed" },
                        {
                            "state": "in_flight",
                            "updated_at": { "$lt": BsonDateTime::from_chrono(stale_before) },
                        },
                    ],
                },
                doc! {
                    "$set": { "state": "in_flight", "updated_at": BsonDateTime::now() },
                    "$inc": { "attempts": 1 },
                },
                options,
            )
            .await
            .map_err(|e| backend("Failed to reclaim delivery", e))?;

        if let Some(record) = reclaimed {
            return Ok(Claim::Acquired {
                attempt: record.attempts,
            });
        }

        match self.delivery(key).await? {
            Some(record) if record.state == DeliveryState::Delivered => Ok(Claim::AlreadyDelivered),
            _ => Ok(Claim::InFlight),
        }
    }

    async fn complete(
        &self,
        key: &DeliveryKey,
        state: DeliveryState,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let state = mongodb::bson::to_bson(&state)
            .map_err(|e| StoreError::Backend(format!("Failed to encode delivery state: {}", e)))?;
        self.deliveries()
            .update_one(
                doc! { "_id": key.id() },
                doc! {
                    "$set": {
                        "state": state,
                        "last_error": error,
                        "updated_at": BsonDateTime::now(),
                    }
                },
                None,
            )
            .await
            .map_err(|e| backend("Failed to record delivery outcome", e))?;
        Ok(())
    }

    async fn delivery(&self, key: &DeliveryKey) -> Result<Option<DeliveryRecord>, StoreError> {
        self.deliveries()
            .find_one(doc! { "_id": key.id() }, None)
            .await
            .map_err(|e| backend("Failed to find delivery", e))
    }
}
