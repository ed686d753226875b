//! Configuration validation logic.

use std::net::SocketAddr;

use crate::config::schema::EnvelopeConfig;

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "validation error: {}", self.0)
    }
}

impl std::error::Error for ValidationError {}

/// Validate an EnvelopeConfig for semantic correctness.
pub fn validate_config(config: &EnvelopeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.listen_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError(format!(
            "listener.listen_address {:?} is not a host:port address",
            config.listener.listen_address
        )));
    }

    // TLS requires both halves.
    if config.listener.cert.is_empty() != config.listener.key.is_empty() {
        errors.push(ValidationError(
            "listener.cert and listener.key must be set together".to_string(),
        ));
    }

    if config.envelope.max_clients == 0 {
        errors.push(ValidationError(
            "envelope.max_clients must be > 0".to_string(),
        ));
    }
    if config.envelope.timeout_secs == 0 {
        errors.push(ValidationError(
            "envelope.timeout_secs must be > 0".to_string(),
        ));
    }
    if config.envelope.device.is_empty() {
        errors.push(ValidationError("envelope.device must be set".to_string()));
    }

    // Verification is mandatory when tokens are required.
    if config.token.required {
        if config.token.verify_keys.is_empty() {
            errors.push(ValidationError(
                "token.verify_keys must be set when token.required is true".to_string(),
            ));
        }
        if config.token.machine.is_empty() {
            errors.push(ValidationError(
                "token.machine must be set when token.required is true".to_string(),
            ));
        }
        if config.token.subject.is_empty() {
            errors.push(ValidationError(
                "token.subject must be set when token.required is true".to_string(),
            ));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError(format!(
            "observability.metrics_address {:?} is not a host:port address",
            config.observability.metrics_address
        )));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
