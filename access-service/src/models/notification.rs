use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::{AccessRequest, Hold};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Push,
    Email,
    Sms,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Push => write!(f, "push"),
            Channel::Email => write!(f, "email"),
            Channel::Sms => write!(f, "sms"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Granted,
    Denied,
    ExpiringSoon,
    Expired,
    Revoked,
    Extended,
}

impl EventKind {
    /// Channels used when the caller does not pick any.
    pub fn default_channels(&self) -> BTreeSet<Channel> {
        let channels: &[Channel] = match self {
            EventKind::Granted | EventKind::Revoked => &[Channel::Push, Channel::Email],
            EventKind::Denied | EventKind::Extended | EventKind::Expired => &[Channel::Push],
            EventKind::ExpiringSoon => &[Channel::Push, Channel::Sms],
        };
        channels.iter().copied().collect()
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Granted => write!(f, "granted"),
            EventKind::Denied => write!(f, "denied"),
            EventKind::ExpiringSoon => write!(f, "expiring-soon"),
            EventKind::Expired => write!(f, "expired"),
            EventKind::Revoked => write!(f, "revoked"),
            EventKind::Extended => write!(f, "extended"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SiteRole {
    Manager,
    Responder,
}

/// Logical audience of an event, resolved to people by the directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
    User { user_id: String },
    Site { site_id: String },
    Role { site_id: String, role: SiteRole },
    Users { user_ids: Vec<String> },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payload {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PushPlatform {
    Fcm,
    Apns,
}

impl std::fmt::Display for PushPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushPlatform::Fcm => write!(f, "fcm"),
            PushPlatform::Apns => write!(f, "apns"),
        }
    }
}

/// Concrete address on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Recipient {
    Email(String),
    Phone(String),
    Device { token: String, platform: PushPlatform },
}

impl Recipient {
    pub fn channel(&self) -> Channel {
        match self {
            Recipient::Email(_) => Channel::Email,
            Recipient::Phone(_) => Channel::Sms,
            Recipient::Device { .. } => Channel::Push,
        }
    }

    pub fn address(&self) -> &str {
        match self {
            Recipient::Email(a) | Recipient::Phone(a) => a,
            Recipient::Device { token, .. } => token,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub target: Target,
    pub payload: Payload,
    pub channels: BTreeSet<Channel>,
    pub created_at: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(
        kind: EventKind,
        target: Target,
        payload: Payload,
        channels: BTreeSet<Channel>,
    ) -> Self {
        let channels = if channels.is_empty() {
            kind.default_channels()
        } else {
            channels
        };
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            kind,
            target,
            payload,
            channels,
            created_at: Utc::now(),
        }
    }

    /// Event describing a hold transition, addressed to `target`.
    pub fn for_hold(kind: EventKind, hold: &Hold, target: Target) -> Self {
        let title = match kind {
            EventKind::Granted => "Access granted",
            EventKind::Denied => "Access denied",
            EventKind::ExpiringSoon => "Access expiring soon",
            EventKind::Expired => "Access expired",
            EventKind::Revoked => "Access revoked",
            EventKind::Extended => "Access extended",
        };
        let body = match kind {
            EventKind::Revoked => format!(
                "Access to {} was withdrawn: {}",
                hold.resource_id,
                hold.revoked_reason.as_deref().unwrap_or("no reason given")
            ),
            EventKind::Expired => format!("Access to {} has ended", hold.resource_id),
            _ => format!(
                "Access to {} valid until {}",
                hold.resource_id,
                hold.expires_at.to_rfc3339()
            ),
        };

        let mut data = BTreeMap::new();
        data.insert("hold_id".to_string(), hold.hold_id.clone());
        data.insert("request_id".to_string(), hold.request_id.clone());
        data.insert("door_id".to_string(), hold.resource_id.clone());
        data.insert("site_id".to_string(), hold.site_id.clone());
        data.insert("status".to_string(), hold.status.to_string());
        data.insert("expires_at".to_string(), hold.expires_at.to_rfc3339());

        Self::new(
            kind,
            target,
            Payload {
                title: title.to_string(),
                body,
                data,
            },
            BTreeSet::new(),
        )
    }

    /// Denial notice for the requester; there is no hold to describe.
    pub fn denied(request: &AccessRequest) -> Self {
        let reason = request.reason.as_deref().unwrap_or("not approved");
        let mut data = BTreeMap::new();
        data.insert("request_id".to_string(), request.request_id.clone());
        data.insert("door_id".to_string(), request.door_id.clone());
        data.insert("site_id".to_string(), request.site_id.clone());
        data.insert("reason".to_string(), reason.to_string());

        Self::new(
            EventKind::Denied,
            Target::User {
                user_id: request.user_id.clone(),
            },
            Payload {
                title: "Access denied".to_string(),
                body: format!("Your request for {} was denied: {}", request.door_id, reason),
                data,
            },
            BTreeSet::new(),
        )
    }
}
