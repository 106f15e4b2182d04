//! Metrics collection for access-service.
//!
//! HTTP request metrics flow through the `metrics` recorder; domain counters
//! live in a `prometheus` registry appended to the same `/metrics` output.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use prometheus::{IntCounterVec, Opts, Registry};
use std::sync::OnceLock;

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
pub static PROMETHEUS_REGISTRY: OnceLock<Registry> = OnceLock::new();
pub static ACCESS_DECISIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static HOLD_TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static NOTIFICATION_DELIVERIES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static NOTIFICATION_RETRY_EXHAUSTED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn counter(name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec, anyhow::Error> {
    Ok(IntCounterVec::new(Opts::new(name, help), labels)?)
}

/// Install the Prometheus recorder and register domain counters.
///
/// Calling it twice is an error; tests simply never call it and every
/// `record_*` helper becomes a no-op.
pub fn init_metrics() -> Result<(), anyhow::Error> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    METRICS_HANDLE
        .set(handle)
        .map_err(|_| anyhow::anyhow!("metrics handle already initialized"))?;

    let registry = Registry::new();

    let decisions = counter(
        "access_decisions_total",
        "Access request decisions by outcome",
        &["outcome"],
    )?;
    let transitions = counter(
        "hold_transitions_total",
        "Hold lifecycle transitions by resulting status",
        &["status"],
    )?;
    let deliveries = counter(
        "notification_deliveries_total",
        "Notification delivery attempts by channel and result",
        &["channel", "status"],
    )?;
    let exhausted = counter(
        "notification_retry_exhausted_total",
        "Deliveries abandoned after the retry budget ran out",
        &["channel"],
    )?;

    registry.register(Box::new(decisions.clone()))?;
    registry.register(Box::new(transitions.clone()))?;
    registry.register(Box::new(deliveries.clone()))?;
    registry.register(Box::new(exhausted.clone()))?;

    PROMETHEUS_REGISTRY
        .set(registry)
        .map_err(|_| anyhow::anyhow!("prometheus registry already initialized"))?;
    // The registry guard above makes these first-time sets.
    let _ = ACCESS_DECISIONS_TOTAL.set(decisions);
    let _ = HOLD_TRANSITIONS_TOTAL.set(transitions);
    let _ = NOTIFICATION_DELIVERIES_TOTAL.set(deliveries);
    let _ = NOTIFICATION_RETRY_EXHAUSTED_TOTAL.set(exhausted);

    Ok(())
}

/// Get metrics output in Prometheus text format.
pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string());

    if let Some(registry) = PROMETHEUS_REGISTRY.get() {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).ok();
        if let Ok(custom_metrics) = String::from_utf8(buffer) {
            output.push_str(&custom_metrics);
        }
    }

    output
}

pub fn record_decision(outcome: &str) {
    if let Some(counter) = ACCESS_DECISIONS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_hold_transition(status: &str) {
    if let Some(counter) = HOLD_TRANSITIONS_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

pub fn record_delivery(channel: &str, status: &str) {
    if let Some(counter) = NOTIFICATION_DELIVERIES_TOTAL.get() {
        counter.with_label_values(&[channel, status]).inc();
    }
}

pub fn record_retry_exhausted(channel: &str) {
    if let Some(counter) = NOTIFICATION_RETRY_EXHAUSTED_TOTAL.get() {
        counter.with_label_values(&[channel]).inc();
    }
}
