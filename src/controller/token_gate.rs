//! Access-token gate: verifies client-provided `access_token` parameters
//! and attaches the validated claim to the request.

use std::sync::Arc;
use std::time::SystemTime;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::config::TokenConfig;
use crate::controller::Paths;
use crate::observability::metrics;
use crate::token::{Expected, Verifier};

#[derive(Debug, Error)]
pub enum GateError {
    #[error("expected machine name must not be empty")]
    MissingMachine,
}

/// Manages access control for clients providing `access_token` parameters.
pub struct TokenController {
    verifier: Arc<Verifier>,
    machine: String,
    issuer: String,
    required: bool,
    enforced: Paths,
}

impl TokenController {
    pub fn new(
        verifier: Arc<Verifier>,
        config: &TokenConfig,
        enforced: Paths,
    ) -> Result<Self, GateError> {
        if config.machine.is_empty() {
            return Err(GateError::MissingMachine);
        }
        Ok(Self {
            verifier,
            machine: config.machine.clone(),
            issuer: config.issuer.clone(),
            required: config.required,
            enforced,
        })
    }
}

/// Middleware enforcing token admission on enforced paths. On success the
/// validated claim is attached to the request extensions for the gates
/// and handlers that follow.
pub async fn token_limit(
    State(gate): State<Arc<TokenController>>,
    mut request: Request,
    next: Next,
) -> Response {
    if !gate.enforced.contains(request.uri().path()) {
        metrics::record_token_request("accepted", "unenforced");
        return next.run(request).await;
    }

    let token = request
        .uri()
        .query()
        .and_then(|query| query_param(query, "access_token"));
    let Some(token) = token else {
        if gate.required {
            metrics::record_token_request("rejected", "missing");
            return StatusCode::UNAUTHORIZED.into_response();
        }
        // The access token is missing and tokens are not required.
        metrics::record_token_request("accepted", "empty");
        return next.run(request).await;
    };

    let expected = Expected {
        issuer: gate.issuer.clone(),
        // Do not check the subject here. After verification, the handler
        // checks the claim subject for monitoring or a service name.
        audience: vec![gate.machine.clone()],
        time: SystemTime::now(),
    };
    match gate.verifier.verify(&token, &expected) {
        Ok(claims) => {
            metrics::record_token_request("accepted", &claims.iss);
            request.extensions_mut().insert(claims);
            next.run(request).await
        }
        Err(err) => {
            tracing::debug!(error = %err, "access token rejected");
            metrics::record_token_request("rejected", "invalid");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}
