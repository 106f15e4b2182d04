use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use super::{Receipt, Transport, TransportError};
use crate::config::SmtpConfig;
use crate::models::{Channel, Payload, Recipient};

pub struct SmtpTransport {
    config: SmtpConfig,
    relay: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransport {
    pub fn new(config: SmtpConfig) -> Result<Self, TransportError> {
        let creds = Credentials::new(config.user.clone(), config.password.clone());

        let relay = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| {
                TransportError::Configuration(format!("Failed to create SMTP relay: {}", e))
            })?
            .port(config.port)
            .credentials(creds)
            .build();

        Ok(Self { config, relay })
    }

    fn build_message(&self, to: &str, payload: &Payload) -> Result<Message, TransportError> {
        let from: Mailbox = format!("{} <{}>", self.config.from_name, self.config.from_email)
            .parse()
            .map_err(|e| TransportError::Configuration(format!("Invalid from address: {}", e)))?;

        let to: Mailbox = to
            .parse()
            .map_err(|e| TransportError::InvalidRecipient(format!("Invalid recipient: {}", e)))?;

        let text = render_text(payload);
        let html = render_html(payload);

        Message::builder()
            .from(from)
            .to(to)
            .subject(&payload.title)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(text),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html),
                    ),
            )
            .map_err(|e| TransportError::SendFailed(format!("Failed to build message: {}", e)))
    }
}

fn render_text(payload: &Payload) -> String {
    let mut text = payload.body.clone();
    if !payload.data.is_empty() {
        text.push_str("\n\n");
        for (key, value) in &payload.data {
            text.push_str(&format!("{}: {}\n", key, value));
        }
    }
    text
}

fn render_html(payload: &Payload) -> String {
    let rows: String = payload
        .data
        .iter()
        .map(|(k, v)| {
            format!(
                "<tr><th>{}</th><td>{}</td></tr>",
                escape_html(k),
                escape_html(v)
            )
        })
        .collect();
    format!(
        "<h2>{}</h2><p>{}</p><table>{}</table>",
        escape_html(&payload.title),
        escape_html(&payload.body),
        rows
    )
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[async_trait]
impl Transport for SmtpTransport {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn deliver(
        &self,
        recipient: &Recipient,
        payload: &Payload,
    ) -> Result<Receipt, TransportError> {
        if !self.config.enabled {
            return Err(TransportError::NotEnabled(
                "SMTP email transport is not enabled".to_string(),
            ));
        }

        let to = match recipient {
            Recipient::Email(address) => address,
            other => {
                return Err(TransportError::InvalidRecipient(format!(
                    "SMTP cannot deliver to {:?}",
                    other.channel()
                )))
            }
        };

        let message = self.build_message(to, payload)?;

        let response = self
            .relay
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to send email: {}", e)))?;

        let provider_id = response.message().next().map(|s| s.to_string());

        tracing::info!(to = %to, subject = %payload.title, "Email sent");

        Ok(Receipt::new(provider_id))
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        if !self.config.enabled {
            return Ok(());
        }

        self.relay.test_connection().await.map_err(|e| {
            TransportError::Connection(format!("SMTP connection test failed: {}", e))
        })?;

        Ok(())
    }
}
