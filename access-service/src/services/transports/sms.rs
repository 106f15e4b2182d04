use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{Receipt, Transport, TransportError};
use crate::config::Msg91Config;
use crate::models::{Channel, Payload, Recipient};

const MSG91_API_URL: &str = "https://api.msg91.com/api/v5/flow/";
/// Transactional route
const MSG91_ROUTE: &str = "4";
const SMS_MAX_CHARS: usize = 320;

pub struct Msg91Transport {
    config: Msg91Config,
    client: Client,
}

#[derive(Debug, Serialize)]
struct Msg91Request<'a> {
    sender: &'a str,
    route: &'a str,
    country: &'a str,
    sms: Vec<Msg91Sms>,
}

#[derive(Debug, Serialize)]
struct Msg91Sms {
    message: String,
    to: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Msg91Response {
    #[serde(rename = "type")]
    response_type: String,
    message: String,
    #[serde(default)]
    request_id: Option<String>,
}

impl Msg91Transport {
    pub fn new(config: Msg91Config) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }
}

/// Keep digits and a leading `+`.
pub fn normalize_phone(raw: &str) -> String {
    raw.trim()
        .chars()
        .enumerate()
        .filter(|(i, c)| c.is_ascii_digit() || (*i == 0 && *c == '+'))
        .map(|(_, c)| c)
        .collect()
}

fn sms_text(payload: &Payload) -> String {
    let text = format!("{}: {}", payload.title, payload.body);
    if text.chars().count() <= SMS_MAX_CHARS {
        text
    } else {
        text.chars().take(SMS_MAX_CHARS - 3).collect::<String>() + "..."
    }
}

#[async_trait]
impl Transport for Msg91Transport {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn deliver(
        &self,
        recipient: &Recipient,
        payload: &Payload,
    ) -> Result<Receipt, TransportError> {
        if !self.config.enabled {
            return Err(TransportError::NotEnabled(
                "Msg91 SMS transport is not enabled".to_string(),
            ));
        }

        let phone = match recipient {
            Recipient::Phone(number) => normalize_phone(number),
            other => {
                return Err(TransportError::InvalidRecipient(format!(
                    "Msg91 cannot deliver to {:?}",
                    other.channel()
                )))
            }
        };

        if phone.trim_start_matches('+').is_empty() {
            return Err(TransportError::InvalidRecipient(
                "Phone number is empty".to_string(),
            ));
        }

        let request = Msg91Request {
            sender: &self.config.sender_id,
            route: MSG91_ROUTE,
            country: &self.config.country_code,
            sms: vec![Msg91Sms {
                message: sms_text(payload),
                to: vec![phone.clone()],
            }],
        };

        let response = self
            .client
            .post(MSG91_API_URL)
            .header("authkey", &self.config.auth_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to connect to Msg91: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(TransportError::RateLimited("Msg91 throttled the request".to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::SendFailed(format!(
                "Msg91 API returned error status {}: {}",
                status, body
            )));
        }

        let msg91_response: Msg91Response = response.json().await.map_err(|e| {
            TransportError::SendFailed(format!("Failed to parse Msg91 response: {}", e))
        })?;

        if msg91_response.response_type != "success" {
            return Err(TransportError::SendFailed(format!(
                "Msg91 error: {}",
                msg91_response.message
            )));
        }

        tracing::info!(to = %phone, "SMS sent via Msg91");

        Ok(Receipt::new(msg91_response.request_id))
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        if !self.config.enabled {
            return Ok(());
        }

        if self.config.auth_key.is_empty() {
            return Err(TransportError::Configuration(
                "Msg91 auth_key is not configured".to_string(),
            ));
        }

        if self.config.sender_id.is_empty() {
            return Err(TransportError::Configuration(
                "Msg91 sender_id is not configured".to_string(),
            ));
        }

        Ok(())
    }
}
