use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{Receipt, Transport, TransportError};
use crate::models::{Channel, Payload, Recipient};

/// A delivery captured by [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub address: String,
    pub payload: Payload,
}

/// In-process transport that records deliveries and can be scripted to fail.
pub struct MockTransport {
    channel: Channel,
    sent: Mutex<Vec<SentMessage>>,
    failing_addresses: Mutex<HashSet<String>>,
    failures_remaining: AtomicU32,
    delay: Option<Duration>,
}

impl MockTransport {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            sent: Mutex::new(Vec::new()),
            failing_addresses: Mutex::new(HashSet::new()),
            failures_remaining: AtomicU32::new(0),
            delay: None,
        }
    }

    /// Sleep before every delivery, for exercising timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next `n` deliveries regardless of address.
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Always fail deliveries to `address` until cleared.
    pub fn fail_address(&self, address: &str) {
        if let Ok(mut failing) = self.failing_addresses.lock() {
            failing.insert(address.to_string());
        }
    }

    pub fn clear_failures(&self) {
        self.failures_remaining.store(0, Ordering::SeqCst);
        if let Ok(mut failing) = self.failing_addresses.lock() {
            failing.clear();
        }
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or_default()
    }

    pub fn sent_to(&self, address: &str) -> usize {
        self.sent
            .lock()
            .map(|s| s.iter().filter(|m| m.address == address).count())
            .unwrap_or_default()
    }

    /// Deliveries whose payload title matches `title`.
    pub fn sent_with_title(&self, title: &str) -> usize {
        self.sent
            .lock()
            .map(|s| s.iter().filter(|m| m.payload.title == title).count())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn deliver(
        &self,
        recipient: &Recipient,
        payload: &Payload,
    ) -> Result<Receipt, TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if recipient.channel() != self.channel {
            return Err(TransportError::InvalidRecipient(format!(
                "{} transport cannot deliver to {}",
                self.channel,
                recipient.channel()
            )));
        }

        let address = recipient.address().to_string();

        let scripted_failure = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let address_failure = self
            .failing_addresses
            .lock()
            .map(|f| f.contains(&address))
            .unwrap_or(false);
        if scripted_failure || address_failure {
            return Err(TransportError::SendFailed(format!(
                "[MOCK] {} delivery to {} failed",
                self.channel, address
            )));
        }

        let mut sent = self
            .sent
            .lock()
            .map_err(|e| TransportError::SendFailed(format!("Mock mutex poisoned: {}", e)))?;
        sent.push(SentMessage {
            address: address.clone(),
            payload: payload.clone(),
        });
        let count = sent.len();
        drop(sent);

        tracing::info!(
            channel = %self.channel,
            to = %address,
            title = %payload.title,
            "[MOCK] Notification would be sent"
        );

        Ok(Receipt::new(Some(format!("mock-{}-{}", self.channel, count))))
    }

    async fn health_check(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
