//! Session coordinator: the admission endpoint couples a firewall grant
//! to a client-held WebSocket connection and guarantees a revoke on every
//! exit path.

pub mod waker;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::firewall::{FirewallError, Manager};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::token::Claims;

/// WebSocket subprotocol spoken by envelope clients.
pub const ENVELOPE_SUBPROTOCOL: &str = "net.measurementlab.envelope";

/// Shared state for the admission endpoint.
pub struct EnvelopeState {
    pub manager: Arc<dyn Manager>,
    pub subject: String,
    pub token_required: bool,
    pub min_timeout: Duration,
    pub shutdown: Shutdown,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeadlineError {
    #[error("missing claim when tokens required")]
    MissingClaim,
    #[error("wrong claim subject")]
    WrongSubject,
    #[error("already past claim expiration")]
    AlreadyExpired,
}

/// Handle `GET /v0/envelope/access`: grant temporary subnet access for
/// the client address and hold it for the lifetime of the upgraded
/// connection. This is a state-changing operation.
pub async fn allow_request(
    State(state): State<Arc<EnvelopeState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    request: Request,
) -> Response {
    // The client remote address is the basis of the temporary grant.
    let remote = peer.ip();

    let claim = request.extensions().get::<Claims>().cloned();
    let deadline = match derive_deadline(
        claim.as_ref(),
        &state.subject,
        state.token_required,
        state.min_timeout,
    ) {
        Ok(deadline) => deadline,
        Err(err) => {
            tracing::debug!(error = %err, client = %remote, "failed to derive session deadline");
            // Deadline errors are static strings, safe as metric labels.
            metrics::record_envelope_request(&err.to_string());
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match state.manager.grant(remote).await {
        Ok(()) => {}
        Err(FirewallError::MaxConcurrent) => {
            tracing::debug!(client = %remote, "grant limit reached");
            metrics::record_envelope_request("max-concurrent");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        Err(err) => {
            tracing::warn!(error = %err, client = %remote, "grant failed");
            metrics::record_envelope_request("grant-failure");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    let manager = Arc::clone(&state.manager);
    let shutdown = state.shutdown.subscribe();
    ws.protocols([ENVELOPE_SUBPROTOCOL])
        .on_upgrade(move |socket| session(socket, remote, deadline, manager, shutdown))
        .into_response()
}

/// Hold the grant open until the deadline passes, the service shuts
/// down, or the client sends anything (or disconnects), then revoke.
async fn session(
    socket: WebSocket,
    remote: IpAddr,
    deadline: SystemTime,
    manager: Arc<dyn Manager>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let ttl = deadline
        .duration_since(SystemTime::now())
        .unwrap_or_default();
    let (mut sink, mut stream) = socket.split();

    tokio::select! {
        _ = tokio::time::sleep(ttl) => {}
        _ = shutdown.recv() => {}
        _ = waker::read_once(&mut stream) => {}
    }
    let _ = sink.close().await;

    if let Err(err) = manager.revoke(remote).await {
        // The rule is still live and the budget no longer reflects the
        // ruleset. Terminate so a restart restores the saved rules.
        tracing::error!(error = %err, client = %remote, "failed to remove rule, terminating");
        std::process::exit(1);
    }
    metrics::record_envelope_request("success");
}

/// Compute the session deadline from the attached claim and the
/// service-wide minimum timeout.
fn derive_deadline(
    claim: Option<&Claims>,
    subject: &str,
    token_required: bool,
    min_timeout: Duration,
) -> Result<SystemTime, DeadlineError> {
    let now = SystemTime::now();
    // The earliest the deadline may be.
    let min_deadline = now + min_timeout;

    let Some(claim) = claim else {
        // Possible when tokens are not required.
        return if token_required {
            Err(DeadlineError::MissingClaim)
        } else {
            Ok(min_deadline)
        };
    };

    if claim.sub != subject {
        return Err(DeadlineError::WrongSubject);
    }

    // Measurements may run, possibly repeatedly, until the claim expires.
    let expiry = claim.expiry().ok_or(DeadlineError::AlreadyExpired)?;
    if expiry < now {
        return Err(DeadlineError::AlreadyExpired);
    }

    // Never earlier than the configured floor.
    Ok(expiry.max(min_deadline))
}
