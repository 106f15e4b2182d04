use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Receipt, Transport, TransportError};
use crate::config::FcmConfig;
use crate::models::{Channel, Payload, PushPlatform, Recipient};

const FCM_API_URL: &str = "https://fcm.googleapis.com/v1/projects";

pub struct FcmTransport {
    config: FcmConfig,
    client: Client,
}

#[derive(Debug, Serialize)]
struct FcmRequest<'a> {
    message: FcmMessage<'a>,
}

#[derive(Debug, Serialize)]
struct FcmMessage<'a> {
    token: &'a str,
    notification: FcmNotification<'a>,
    data: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    android: Option<FcmAndroidConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    apns: Option<FcmApnsConfig>,
}

#[derive(Debug, Serialize)]
struct FcmNotification<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct FcmAndroidConfig {
    priority: &'static str,
}

#[derive(Debug, Serialize)]
struct FcmApnsConfig {
    headers: BTreeMap<&'static str, &'static str>,
}

#[derive(Debug, Deserialize)]
struct FcmResponse {
    name: Option<String>,
    #[serde(default)]
    error: Option<FcmError>,
}

#[derive(Debug, Deserialize)]
struct FcmError {
    message: String,
    status: String,
}

impl FcmTransport {
    pub fn new(config: FcmConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    fn access_token(&self) -> Result<&str, TransportError> {
        if self.config.access_token.is_empty() {
            return Err(TransportError::Authentication(
                "FCM access token not configured".to_string(),
            ));
        }
        Ok(&self.config.access_token)
    }
}

#[async_trait]
impl Transport for FcmTransport {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn deliver(
        &self,
        recipient: &Recipient,
        payload: &Payload,
    ) -> Result<Receipt, TransportError> {
        if !self.config.enabled {
            return Err(TransportError::NotEnabled(
                "FCM push transport is not enabled".to_string(),
            ));
        }

        if self.config.project_id.is_empty() {
            return Err(TransportError::Configuration(
                "FCM project_id is not configured".to_string(),
            ));
        }

        let (token, platform) = match recipient {
            Recipient::Device { token, platform } => (token.as_str(), *platform),
            other => {
                return Err(TransportError::InvalidRecipient(format!(
                    "FCM cannot deliver to {:?}",
                    other.channel()
                )))
            }
        };

        let access_token = self.access_token()?;

        // Door-access notices are time sensitive on both platforms
        let (android, apns) = match platform {
            PushPlatform::Fcm => (Some(FcmAndroidConfig { priority: "high" }), None),
            PushPlatform::Apns => {
                let mut headers = BTreeMap::new();
                headers.insert("apns-priority", "10");
                (None, Some(FcmApnsConfig { headers }))
            }
        };

        let request = FcmRequest {
            message: FcmMessage {
                token,
                notification: FcmNotification {
                    title: &payload.title,
                    body: &payload.body,
                },
                data: &payload.data,
                android,
                apns,
            },
        };

        let url = format!("{}/{}/messages:send", FCM_API_URL, self.config.project_id);

        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .json(&request)
            .send()
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to connect to FCM: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(TransportError::RateLimited("FCM quota exceeded".to_string()));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(TransportError::Authentication(format!(
                "FCM rejected credentials with status {}",
                status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::SendFailed(format!(
                "FCM API returned error status {}: {}",
                status, body
            )));
        }

        let fcm_response: FcmResponse = response.json().await.map_err(|e| {
            TransportError::SendFailed(format!("Failed to parse FCM response: {}", e))
        })?;

        if let Some(error) = fcm_response.error {
            return Err(TransportError::SendFailed(format!(
                "FCM error ({}): {}",
                error.status, error.message
            )));
        }

        tracing::info!(platform = %platform, "Push notification sent via FCM");

        Ok(Receipt::new(fcm_response.name))
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        if !self.config.enabled {
            return Ok(());
        }

        if self.config.project_id.is_empty() {
            return Err(TransportError::Configuration(
                "FCM project_id is not configured".to_string(),
            ));
        }

        self.access_token().map(|_| ())
    }
}
