//! HTTP handlers for access-service.
//!
//! Handlers validate DTOs, call [`AccessService`](crate::services::AccessService)
//! and map its errors through `AppError`.

pub mod health;
pub mod holds;
pub mod notifications;
pub mod requests;
pub mod sweeps;
pub mod tokens;

pub use health::{health_check, metrics_endpoint, readiness_check};
pub use holds::{extend_hold, get_hold, revoke_hold};
pub use notifications::{batch_send, dispatch_notification};
pub use requests::{decide_access_request, get_access_request, submit_access_request};
pub use sweeps::run_sweep;
pub use tokens::validate_token;
