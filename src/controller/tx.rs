//! Transmit-rate controller: samples the outbound byte counter of a
//! device and rejects new work once a smoothed rate estimate exceeds the
//! configured ceiling.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::TxConfig;
use crate::controller::{is_monitoring, Paths};
use crate::observability::metrics;
use crate::token::Claims;

/// Sampling cadence for the device byte counter.
const SAMPLE_PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum TxError {
    #[error("no device configured")]
    NoDevice,
    #[error("device not found: {0:?}")]
    DeviceMissing(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Calculates the bytes transmitted from the named device every sample
/// period and publishes a smoothed bits-per-second estimate.
#[derive(Debug)]
pub struct TxController {
    device: String,
    limit: u64,
    period: Duration,
    current: AtomicU64,
    proc_path: PathBuf,
    enforced: Paths,
}

impl TxController {
    /// Create a controller and verify that the device exists. Callers
    /// should spawn [`TxController::watch`] to keep the estimate fresh.
    pub async fn new(config: &TxConfig, enforced: Paths) -> Result<Arc<Self>, TxError> {
        if config.device.is_empty() {
            return Err(TxError::NoDevice);
        }
        let tx = Arc::new(Self {
            device: config.device.clone(),
            limit: config.max_rate,
            period: SAMPLE_PERIOD,
            current: AtomicU64::new(0),
            proc_path: config.proc_path.clone(),
            enforced,
        });
        tx.read_tx_bytes().await?;
        Ok(tx)
    }

    /// The current smoothed rate estimate in bits per second.
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    fn set(&self, value: u64) {
        self.current.store(value, Ordering::Relaxed);
    }

    /// Whether the request should be rejected. Monitoring requests and
    /// requests outside the enforced paths are always accepted.
    pub fn is_limited(&self, protocol: &str, monitoring: bool, enforced_path: bool) -> bool {
        let current = self.current();
        if self.limit > 0 && current > self.limit && !monitoring && enforced_path {
            metrics::record_tx_request("rejected", protocol);
            return true;
        }
        metrics::record_tx_request("accepted", protocol);
        false
    }

    /// Accept a raw TCP connection, closing it immediately when the rate
    /// is over the limit. All raw accepts count as enforced paths.
    pub async fn accept(
        &self,
        listener: &TcpListener,
    ) -> std::io::Result<(TcpStream, SocketAddr)> {
        let (conn, addr) = listener.accept().await?;
        if self.is_limited("raw", false, true) {
            // Dropping the stream closes the connection.
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("transmit rate over limit, rejecting {addr}"),
            ));
        }
        Ok((conn, addr))
    }

    /// Update the rate estimate every period until the shutdown signal
    /// fires. Returns immediately when no ceiling is configured.
    pub async fn watch(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if self.limit == 0 {
            return;
        }
        let mut ticker = tokio::time::interval(self.period);
        let mut prev_bytes = match self.read_tx_bytes().await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(error = %err, device = %self.device, "cannot watch device");
                return;
            }
        };
        let mut rate_prev = 0.0_f64;
        let mut tick_prev = Instant::now() - self.period;
        // Alpha controls the decay rate based on the sample period.
        let alpha = self.period.as_secs_f64() / 2.0;

        loop {
            let tick_now = tokio::select! {
                _ = shutdown.recv() => break,
                tick = ticker.tick() => tick,
            };
            let bytes = match self.read_tx_bytes().await {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(error = %err, device = %self.device, "failed to read device counters");
                    continue;
                }
            };
            // Under heavy load ticks may fire late and then early. Only
            // update when the interval is longer than half the period.
            let elapsed = tick_now.duration_since(tick_prev).as_secs_f64();
            if elapsed > self.period.as_secs_f64() / 2.0 {
                let rate_now = 8.0 * bytes.saturating_sub(prev_bytes) as f64 / elapsed;
                // Rapid response to increases, slow decay on decreases.
                rate_prev = smoothed(rate_prev, rate_now, alpha);
                self.set(rate_prev as u64);
                prev_bytes = bytes;
                tick_prev = tick_now;
            }
        }
    }

    async fn read_tx_bytes(&self) -> Result<u64, TxError> {
        let path = self.proc_path.join("net/dev");
        let contents = tokio::fs::read_to_string(&path).await?;
        parse_tx_bytes(&contents, &self.device)
            .ok_or_else(|| TxError::DeviceMissing(self.device.clone()))
    }
}

fn smoothed(prev: f64, instantaneous: f64, alpha: f64) -> f64 {
    instantaneous.max((1.0 - alpha) * prev + alpha * instantaneous)
}

/// Extract the cumulative transmit byte counter for `device` from
/// /proc/net/dev contents: the ninth value after the interface name.
fn parse_tx_bytes(contents: &str, device: &str) -> Option<u64> {
    for line in contents.lines() {
        let Some((name, counters)) = line.split_once(':') else {
            continue;
        };
        if name.trim() != device {
            continue;
        }
        return counters.split_whitespace().nth(8)?.parse().ok();
    }
    None
}

/// Middleware rejecting requests while the transmit rate is over the
/// limit. Monitoring requests, identified by the claim attached by the
/// token gate, bypass the limit.
pub async fn tx_limit(
    State(tx): State<Arc<TxController>>,
    request: Request,
    next: Next,
) -> Response {
    let monitoring = is_monitoring(request.extensions().get::<Claims>());
    let enforced = tx.enforced.contains(request.uri().path());
    if tx.is_limited("http", monitoring, enforced) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    next.run(request).await
}
