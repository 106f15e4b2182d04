use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::datetime::{chrono_as_bson, opt_chrono_as_bson};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HoldStatus {
    Active,
    Expiring,
    Extended,
    Expired,
    Revoked,
}

impl HoldStatus {
    /// Live holds occupy their resource.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            HoldStatus::Active | HoldStatus::Expiring | HoldStatus::Extended
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_live()
    }
}

impl std::fmt::Display for HoldStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HoldStatus::Active => write!(f, "active"),
            HoldStatus::Expiring => write!(f, "expiring"),
            HoldStatus::Extended => write!(f, "extended"),
            HoldStatus::Expired => write!(f, "expired"),
            HoldStatus::Revoked => write!(f, "revoked"),
        }
    }
}

/// A granted, time-bounded reservation of a door or equipment slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hold {
    #[serde(rename = "_id")]
    pub hold_id: String,
    pub request_id: String,
    pub resource_id: String,
    pub user_id: String,
    pub site_id: String,
    pub permissions: BTreeSet<String>,
    pub status: HoldStatus,
    /// Mirrors `status.is_live()`; the store indexes it to keep one live hold per resource.
    pub live: bool,
    #[serde(with = "chrono_as_bson")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono_as_bson")]
    pub expires_at: DateTime<Utc>,
    pub extension_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_chrono_as_bson")]
    pub closed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

/// Parameters for a new hold.
#[derive(Debug, Clone)]
pub struct NewHold {
    pub request_id: String,
    pub resource_id: String,
    pub user_id: String,
    pub site_id: String,
    pub permissions: BTreeSet<String>,
    pub ttl: Duration,
}

impl Hold {
    /// Expiry is kept at whole seconds so it lines up with token `exp` claims.
    pub fn new(params: NewHold, now: DateTime<Utc>) -> Self {
        Self {
            hold_id: uuid::Uuid::new_v4().to_string(),
            request_id: params.request_id,
            resource_id: params.resource_id,
            user_id: params.user_id,
            site_id: params.site_id,
            permissions: params.permissions,
            status: HoldStatus::Active,
            live: true,
            created_at: now,
            expires_at: (now + params.ttl).trunc_subsecs(0),
            extension_count: 0,
            revoked_reason: None,
            closed_at: None,
            version: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    /// Past its expiry but not yet transitioned by a sweep.
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_live() && self.is_lapsed(now)
    }

    pub fn next_version(&self) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next
    }

    pub fn extended(&self, by: Duration) -> Self {
        let mut next = self.next_version();
        next.expires_at = self.expires_at + by;
        next.extension_count += 1;
        next.status = HoldStatus::Extended;
        next
    }

    pub fn expiring(&self) -> Self {
        let mut next = self.next_version();
        next.status = HoldStatus::Expiring;
        next
    }

    pub fn expired(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.next_version();
        next.status = HoldStatus::Expired;
        next.live = false;
        next.closed_at = Some(now);
        next
    }

    pub fn revoked(&self, reason: &str, now: DateTime<Utc>) -> Self {
        let mut next = self.next_version();
        next.status = HoldStatus::Revoked;
        next.live = false;
        next.revoked_reason = Some(reason.to_string());
        next.closed_at = Some(now);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hold(ttl_minutes: i64) -> Hold {
        Hold::new(
            NewHold {
                request_id: "req-1".to_string(),
                resource_id: "D1".to_string(),
                user_id: "U1".to_string(),
                site_id: "S1".to_string(),
                permissions: BTreeSet::new(),
                ttl: Duration::minutes(ttl_minutes),
            },
            Utc::now(),
        )
    }

    #[test]
    fn new_hold_is_active_with_whole_second_expiry() {
        let hold = hold(30);
        assert_eq!(hold.status, HoldStatus::Active);
        assert_eq!(hold.expires_at.timestamp_subsec_nanos(), 0);
        assert!(hold.is_live());
    }

    #[test]
    fn due_only_when_live_and_lapsed() {
        let hold = hold(5);
        let later = hold.expires_at + Duration::seconds(1);

        assert!(!hold.is_due(Utc::now()));
        assert!(hold.is_due(later));
        assert!(hold.is_due(hold.expires_at));
        assert!(!hold.expired(later).is_due(later));
        assert!(!hold.revoked("manual", later).live);
    }

    #[test]
    fn extension_moves_expiry_and_counts() {
        let hold = hold(5);
        let extended = hold.extended(Duration::minutes(10));

        assert_eq!(extended.expires_at, hold.expires_at + Duration::minutes(10));
        assert_eq!(extended.extension_count, 1);
        assert_eq!(extended.status, HoldStatus::Extended);
        assert_eq!(extended.version, hold.version + 1);
    }
}
