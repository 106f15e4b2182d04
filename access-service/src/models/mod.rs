pub mod access_request;
pub mod audit;
pub mod datetime;
pub mod hold;
pub mod notification;

pub use access_request::{AccessRequest, Outcome, RequestStatus};
pub use audit::{AuditAction, AuditRecord};
pub use hold::{Hold, HoldStatus, NewHold};
pub use notification::{
    Channel, EventKind, NotificationEvent, Payload, PushPlatform, Recipient, SiteRole, Target,
};
