use service_core::error::AppError;
use thiserror::Error;

use crate::services::store::StoreError;
use crate::services::transports::TransportError;

/// Failures of the hold/request lifecycle operations.
///
/// Token validation has no variant here: forged or stale tokens are an
/// expected input and come back as a `TokenValidation::Invalid` value.
#[derive(Debug, Error)]
pub enum AccessError {
    /// Malformed or unknown input. Not retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The operation does not apply to the entity's current lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Another live hold owns the resource.
    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A notification channel failed. Never rolls back a committed transition.
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    #[error("Token signing failed: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

impl AccessError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AccessError::Validation(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        AccessError::InvalidState(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        AccessError::NotFound(msg.into())
    }

    /// Stable machine-readable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            AccessError::Validation(_) => "validation_error",
            AccessError::InvalidState(_) => "invalid_state",
            AccessError::ResourceBusy(_) => "resource_busy",
            AccessError::NotFound(_) => "not_found",
            AccessError::Transport(_) => "transport_error",
            AccessError::Timeout(_) => "timeout",
            AccessError::Store(_) => "store_error",
            AccessError::Signing(_) => "signing_error",
        }
    }
}

impl From<AccessError> for AppError {
    fn from(err: AccessError) -> Self {
        let code = err.code();
        match err {
            AccessError::Validation(msg) => {
                AppError::UnprocessableEntity(anyhow::anyhow!("{}: {}", code, msg))
            }
            AccessError::InvalidState(msg) | AccessError::ResourceBusy(msg) => {
                AppError::Conflict(anyhow::anyhow!("{}: {}", code, msg))
            }
            AccessError::NotFound(msg) => AppError::NotFound(anyhow::anyhow!("{}: {}", code, msg)),
            AccessError::Transport(e) => AppError::BadGateway(e.to_string()),
            AccessError::Timeout(ms) => {
                AppError::GatewayTimeout(format!("operation exceeded {} ms", ms))
            }
            AccessError::Store(e) => AppError::DatabaseError(anyhow::anyhow!(e.to_string())),
            AccessError::Signing(e) => AppError::InternalError(anyhow::anyhow!(e.to_string())),
        }
    }
}
