use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::datetime::{chrono_as_bson, opt_chrono_as_bson};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Granted,
    Denied,
    Expired,
    Revoked,
}

impl RequestStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, RequestStatus::Pending | RequestStatus::Granted)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestStatus::Pending => write!(f, "pending"),
            RequestStatus::Granted => write!(f, "granted"),
            RequestStatus::Denied => write!(f, "denied"),
            RequestStatus::Expired => write!(f, "expired"),
            RequestStatus::Revoked => write!(f, "revoked"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Grant,
    Deny,
}

/// A user's request for access to one door at one site.
///
/// Records are never deleted; they are the audit trail of who asked for what.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessRequest {
    #[serde(rename = "_id")]
    pub request_id: String,
    pub user_id: String,
    pub door_id: String,
    pub site_id: String,
    pub permissions: BTreeSet<String>,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold_id: Option<String>,
    #[serde(with = "chrono_as_bson")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_chrono_as_bson")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_chrono_as_bson")]
    pub closed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl AccessRequest {
    pub fn new(
        user_id: String,
        door_id: String,
        site_id: String,
        permissions: BTreeSet<String>,
        ttl_minutes: Option<i64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            user_id,
            door_id,
            site_id,
            permissions,
            status: RequestStatus::Pending,
            ttl_minutes,
            reason: None,
            hold_id: None,
            created_at: now,
            decided_at: None,
            closed_at: None,
            version: 0,
        }
    }

    /// Copy with the next version number, ready for a compare-and-swap write.
    pub fn next_version(&self) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next
    }

    pub fn granted(&self, hold_id: &str, now: DateTime<Utc>) -> Self {
        let mut next = self.next_version();
        next.status = RequestStatus::Granted;
        next.hold_id = Some(hold_id.to_string());
        next.decided_at = Some(now);
        next
    }

    pub fn denied(&self, reason: Option<String>, now: DateTime<Utc>) -> Self {
        let mut next = self.next_version();
        next.status = RequestStatus::Denied;
        next.reason = reason;
        next.decided_at = Some(now);
        next
    }

    pub fn closed(&self, status: RequestStatus, now: DateTime<Utc>) -> Self {
        let mut next = self.next_version();
        next.status = status;
        next.closed_at = Some(now);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AccessRequest {
        AccessRequest::new(
            "U1".to_string(),
            "D1".to_string(),
            "S1".to_string(),
            ["open".to_string()].into_iter().collect(),
            None,
            Utc::now(),
        )
    }

    #[test]
    fn transitions_bump_version_and_stamp_times() {
        let request = sample();
        let granted = request.granted("hold-1", Utc::now());

        assert_eq!(granted.version, request.version + 1);
        assert_eq!(granted.status, RequestStatus::Granted);
        assert_eq!(granted.hold_id.as_deref(), Some("hold-1"));
        assert!(granted.decided_at.is_some());

        let closed = granted.closed(RequestStatus::Expired, Utc::now());
        assert_eq!(closed.version, request.version + 2);
        assert!(closed.closed_at.is_some());
        assert!(closed.status.is_final());
    }

    #[test]
    fn pending_and_granted_are_not_final() {
        assert!(!RequestStatus::Pending.is_final());
        assert!(!RequestStatus::Granted.is_final());
        assert!(RequestStatus::Denied.is_final());
        assert!(RequestStatus::Revoked.is_final());
    }
}
