use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::datetime::chrono_as_bson;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Submitted,
    Granted,
    Denied,
    TokenIssued,
    TokenReissued,
    Extended,
    Revoked,
    Expired,
}

/// Append-only record of something that happened to a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    #[serde(rename = "_id")]
    pub record_id: String,
    pub request_id: String,
    pub action: AuditAction,
    /// SHA-256 of the token; the token itself is never stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_fingerprint: Option<String>,
    #[serde(with = "chrono_as_bson")]
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(request_id: &str, action: AuditAction, token: Option<&str>) -> Self {
        Self {
            record_id: uuid::Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            action,
            token_fingerprint: token.map(token_fingerprint),
            recorded_at: Utc::now(),
        }
    }
}

pub fn token_fingerprint(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
