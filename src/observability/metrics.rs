//! Metrics collection and exposition.

use std::net::SocketAddr;

use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Initialize the Prometheus exporter and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus recorder");

    tracing::info!(address = %addr, "Metrics server listening");
}

/// Count a request handled by the envelope endpoint, by outcome.
pub fn record_envelope_request(status: &str) {
    counter!("envelope_requests_total", "status" => status.to_string()).increment(1);
}

/// Count a request handled by the access-token gate.
pub fn record_token_request(request: &str, reason: &str) {
    counter!(
        "envelope_access_token_requests_total",
        "request" => request.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Count a request handled by the transmit-rate gate.
pub fn record_tx_request(request: &str, protocol: &str) {
    counter!(
        "envelope_access_txcontroller_requests_total",
        "request" => request.to_string(),
        "protocol" => protocol.to_string()
    )
    .increment(1);
}
