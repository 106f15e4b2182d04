pub mod email;
pub mod mock;
pub mod push;
pub mod sms;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Channel, Payload, Recipient};

pub use email::SmtpTransport;
pub use mock::MockTransport;
pub use push::FcmTransport;
pub use sms::Msg91Transport;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport not enabled: {0}")]
    NotEnabled(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Send error: {0}")]
    SendFailed(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Delivery timed out after {0} ms")]
    Timeout(u64),
}

impl TransportError {
    /// Whether a later attempt might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Connection(_)
                | TransportError::SendFailed(_)
                | TransportError::RateLimited(_)
                | TransportError::Timeout(_)
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Receipt {
    pub provider_id: Option<String>,
}

impl Receipt {
    pub fn new(provider_id: Option<String>) -> Self {
        Self { provider_id }
    }
}

/// A push, email or SMS gateway.
#[async_trait]
pub trait Transport: Send + Sync {
    fn channel(&self) -> Channel;

    async fn deliver(
        &self,
        recipient: &Recipient,
        payload: &Payload,
    ) -> Result<Receipt, TransportError>;

    async fn health_check(&self) -> Result<(), TransportError>;
}
